//! Alias-aware field access over one feed record, XML or JSON.

use cbf_core::{collapse_localized, parse_amount, parse_count};
use serde_json::Value as JsonValue;

use crate::xml::XmlNode;

/// Attribute names that carry a URL or value on multi-valued items.
const ITEM_VALUE_ATTRS: &[&str] = &["url", "src", "href", "value"];
/// Child names that carry the value of a wrapped item (`<image><url>…</url></image>`).
const ITEM_VALUE_CHILDREN: &[&str] = &["url", "src", "value", "name"];
const LANGUAGE_ATTRS: &[&str] = &["language", "lang", "xml:lang"];

/// Field access shared by every record shape the normalizer reads.
pub trait FieldSource {
    /// First alias with a usable value. Localized objects collapse to one string.
    fn text(&self, aliases: &[&str]) -> Option<String>;

    fn text_at(&self, path: &[&str]) -> Option<String>;

    /// Ordered, de-duplicated values of a multi-valued field.
    fn list(&self, wrappers: &[&str], items: &[&str]) -> Vec<String>;

    /// Language-tagged entries in document order.
    fn localized(&self, aliases: &[&str]) -> Vec<(String, String)>;

    /// Lenient number; missing or non-numeric gives 0.
    fn amount(&self, aliases: &[&str]) -> f64 {
        self.text(aliases).map(|t| parse_amount(&t)).unwrap_or(0.0)
    }

    fn count(&self, aliases: &[&str]) -> u32 {
        self.text(aliases).map(|t| parse_count(&t)).unwrap_or(0)
    }

    fn positive(&self, aliases: &[&str]) -> Option<f64> {
        let value = self.amount(aliases);
        (value > 0.0).then_some(value)
    }

    fn flag(&self, aliases: &[&str]) -> bool {
        self.text(aliases).is_some_and(|t| is_truthy(&t))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    node: &'a XmlNode,
}

impl<'a> RecordView<'a> {
    pub fn new(node: &'a XmlNode) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &'a XmlNode {
        self.node
    }
}

impl FieldSource for RecordView<'_> {
    /// `<town><en>…</en><es>…</es></town>` collapses like any localized object.
    fn text(&self, aliases: &[&str]) -> Option<String> {
        aliases
            .iter()
            .flat_map(|alias| self.node.children_named(alias))
            .find_map(display_text)
    }

    fn text_at(&self, path: &[&str]) -> Option<String> {
        self.node.at_path(path).and_then(display_text)
    }

    /// Ordered values of a multi-valued field in any of its shapes: a wrapper
    /// holding repeated items, repeated items directly on the record, a
    /// single item, attribute-bearing items, or a delimited wrapper text.
    fn list(&self, wrappers: &[&str], items: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |value: String| {
            if !value.is_empty() && !out.contains(&value) {
                out.push(value);
            }
        };

        for wrapper in wrappers.iter().flat_map(|w| self.node.children_named(w)) {
            let item_nodes: Vec<&XmlNode> = wrapper
                .children
                .iter()
                .filter(|c| items.iter().any(|i| c.name.eq_ignore_ascii_case(i)))
                .collect();
            if item_nodes.is_empty() {
                if let Some(value) = item_value(wrapper) {
                    if wrapper.children.is_empty() && wrapper.attr("url").is_none() {
                        split_delimited(&value).into_iter().for_each(&mut push);
                    } else {
                        push(value);
                    }
                }
                continue;
            }
            for item in item_nodes {
                if let Some(value) = item_value(item) {
                    push(value);
                }
            }
        }

        for item in items.iter().flat_map(|i| self.node.children_named(i)) {
            if let Some(value) = item_value(item) {
                push(value);
            }
        }

        out
    }

    /// Language-tagged entries in document order. Accepts a wrapper with
    /// language children, repeated elements with a language attribute, or a
    /// flat element (recorded as `en`).
    fn localized(&self, aliases: &[&str]) -> Vec<(String, String)> {
        for alias in aliases {
            let mut entries = Vec::new();
            for node in self.node.children_named(alias) {
                if let Some(lang) = LANGUAGE_ATTRS.iter().find_map(|a| node.attr(a)) {
                    if !node.text().is_empty() {
                        entries.push((lang.to_ascii_lowercase(), node.text().to_string()));
                    }
                } else if !node.children.is_empty() {
                    entries.extend(
                        node.children
                            .iter()
                            .filter(|c| !c.text().is_empty())
                            .map(|c| (c.name.to_ascii_lowercase(), c.text().to_string())),
                    );
                } else if !node.text().is_empty() {
                    entries.push(("en".to_string(), node.text().to_string()));
                }
            }
            if !entries.is_empty() {
                return entries;
            }
        }
        Vec::new()
    }
}

/// One object item of a JSON feed.
#[derive(Debug, Clone, Copy)]
pub struct JsonRecord<'a> {
    value: &'a JsonValue,
}

impl<'a> JsonRecord<'a> {
    /// `None` unless the item is a JSON object.
    pub fn new(value: &'a JsonValue) -> Option<Self> {
        value.is_object().then_some(Self { value })
    }
}

impl FieldSource for JsonRecord<'_> {
    fn text(&self, aliases: &[&str]) -> Option<String> {
        aliases
            .iter()
            .filter_map(|alias| self.value.get(*alias))
            .find_map(json_display)
    }

    fn text_at(&self, path: &[&str]) -> Option<String> {
        path.iter()
            .try_fold(self.value, |cur, segment| cur.get(*segment))
            .and_then(json_display)
    }

    fn list(&self, wrappers: &[&str], items: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for key in wrappers.iter().chain(items) {
            let Some(value) = self.value.get(*key) else {
                continue;
            };
            for entry in json_list_values(value, items) {
                if !out.contains(&entry) {
                    out.push(entry);
                }
            }
        }
        out
    }

    fn localized(&self, aliases: &[&str]) -> Vec<(String, String)> {
        for alias in aliases {
            match self.value.get(*alias) {
                Some(JsonValue::Object(map)) => {
                    let entries: Vec<(String, String)> = map
                        .iter()
                        .filter_map(|(lang, v)| {
                            let text = v.as_str()?.trim();
                            (!text.is_empty())
                                .then(|| (lang.to_ascii_lowercase(), text.to_string()))
                        })
                        .collect();
                    if !entries.is_empty() {
                        return entries;
                    }
                }
                Some(JsonValue::String(text)) if !text.trim().is_empty() => {
                    return vec![("en".to_string(), text.trim().to_string())];
                }
                _ => {}
            }
        }
        Vec::new()
    }

    fn amount(&self, aliases: &[&str]) -> f64 {
        for alias in aliases {
            match self.value.get(*alias) {
                Some(JsonValue::Number(n)) => {
                    return n.as_f64().filter(|v| v.is_finite() && *v >= 0.0).unwrap_or(0.0);
                }
                Some(other) => {
                    if let Some(text) = json_display(other) {
                        return parse_amount(&text);
                    }
                }
                None => {}
            }
        }
        0.0
    }
}

fn json_display(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        JsonValue::Object(map) if map.keys().all(|k| is_language_code(k)) => {
            let entries: Vec<(String, String)> = map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            collapse_localized(&entries)
        }
        JsonValue::Object(_) => None,
        JsonValue::Array(_) | JsonValue::Null => None,
    }
}

fn json_list_values(value: &JsonValue, items: &[&str]) -> Vec<String> {
    match value {
        JsonValue::Array(entries) => entries.iter().filter_map(json_item_value).collect(),
        JsonValue::Object(map) => {
            if let Some(inner) = items.iter().find_map(|i| map.get(*i)) {
                return json_list_values(inner, items);
            }
            json_item_value(value).into_iter().collect()
        }
        JsonValue::String(text) => split_delimited(text),
        _ => Vec::new(),
    }
}

fn json_item_value(value: &JsonValue) -> Option<String> {
    if let JsonValue::Object(map) = value {
        if let Some(found) = ITEM_VALUE_CHILDREN
            .iter()
            .chain(ITEM_VALUE_ATTRS)
            .filter_map(|k| map.get(*k))
            .find_map(json_display)
        {
            return Some(found);
        }
    }
    json_display(value)
}

fn display_text(node: &XmlNode) -> Option<String> {
    if !node.text().is_empty() {
        return Some(node.text().to_string());
    }
    if node.children.is_empty() || !node.children.iter().all(|c| is_language_code(&c.name)) {
        return None;
    }
    let entries: Vec<(String, String)> = node
        .children
        .iter()
        .map(|c| (c.name.clone(), c.text.clone()))
        .collect();
    collapse_localized(&entries)
}

fn item_value(node: &XmlNode) -> Option<String> {
    ITEM_VALUE_CHILDREN
        .iter()
        .filter_map(|name| node.child(name))
        .map(|c| c.text())
        .chain(ITEM_VALUE_ATTRS.iter().filter_map(|a| node.attr(a)).map(str::trim))
        .chain(std::iter::once(node.text()))
        .find(|v| !v.is_empty())
        .map(ToString::to_string)
        .or_else(|| display_text(node))
}

fn split_delimited(text: &str) -> Vec<String> {
    text.split([',', '|', '\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// ISO 639-1 codes seen in Spanish property feeds. Two-letter element names
/// outside this list, such as `id`, are ordinary fields.
const LANGUAGE_CODES: &[&str] = &[
    "ar", "ca", "cs", "da", "de", "el", "en", "es", "et", "eu", "fi", "fr", "gl", "he", "hu",
    "it", "ja", "ko", "lt", "lv", "nb", "nl", "nn", "no", "pl", "pt", "ro", "ru", "sk", "sv",
    "tr", "uk", "zh",
];

/// `en`, `es`, `pt_br`, `en-GB` and the like.
pub(crate) fn is_language_code(name: &str) -> bool {
    let mut parts = name.splitn(2, ['_', '-']);
    let primary = parts.next().unwrap_or_default();
    let region_ok = parts
        .next()
        .map(|r| (2..=3).contains(&r.len()) && r.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(true);
    LANGUAGE_CODES
        .iter()
        .any(|code| code.eq_ignore_ascii_case(primary))
        && region_ok
}

pub(crate) fn is_truthy(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "y" | "si" | "sí"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view_of(xml: &str) -> XmlNode {
        XmlNode::parse_fragment(xml).unwrap()
    }

    #[test]
    fn aliases_resolve_in_order_and_cdata_equals_plain() {
        let node = view_of(
            "<property><reference><![CDATA[ N100 ]]></reference><city>Orihuela Costa</city></property>",
        );
        let view = RecordView::new(&node);
        assert_eq!(view.text(&["ref", "reference", "id"]).as_deref(), Some("N100"));
        assert_eq!(view.text(&["town", "location", "city"]).as_deref(), Some("Orihuela Costa"));
        assert_eq!(view.text(&["zone"]), None);
    }

    #[test]
    fn wrapper_without_language_children_is_not_text() {
        let node = view_of(
            "<property><location><latitude>37.9</latitude><longitude>-0.7</longitude></location><city>Torrevieja</city></property>",
        );
        let view = RecordView::new(&node);
        assert_eq!(view.text(&["location", "city"]).as_deref(), Some("Torrevieja"));
        assert_eq!(view.text_at(&["location", "latitude"]).as_deref(), Some("37.9"));
    }

    #[test]
    fn two_letter_field_wrappers_are_not_translations() {
        let node = view_of("<property><town><id>5</id></town><city>Rojales</city></property>");
        let view = RecordView::new(&node);
        assert_eq!(view.text(&["town", "city"]).as_deref(), Some("Rojales"));
        let node = view_of("<property><town><en>Javea</en><es>Xàbia</es></town></property>");
        assert_eq!(RecordView::new(&node).text(&["town"]).as_deref(), Some("Javea"));
    }

    #[test]
    fn localized_objects_collapse_to_english() {
        let node = view_of("<property><type><es>Ático</es><en>Penthouse</en></type></property>");
        let view = RecordView::new(&node);
        assert_eq!(view.text(&["type"]).as_deref(), Some("Penthouse"));
    }

    #[test]
    fn numbers_default_to_zero() {
        let node = view_of("<property><price>abc</price><beds></beds><baths>2</baths></property>");
        let view = RecordView::new(&node);
        assert_eq!(view.amount(&["price"]), 0.0);
        assert_eq!(view.count(&["beds", "bedrooms"]), 0);
        assert_eq!(view.count(&["baths"]), 2);
        assert_eq!(view.positive(&["price"]), None);
    }

    #[test]
    fn multi_valued_fields_normalise_every_shape() {
        let wrapped = view_of(
            "<p><images><image id=\"1\"><url>https://i/1.jpg</url></image><image id=\"2\"><url>https://i/2.jpg</url></image></images></p>",
        );
        let repeated =
            view_of("<p><photo>https://i/1.jpg</photo><photo>https://i/2.jpg</photo></p>");
        let attributed = view_of(
            "<p><images><image url=\"https://i/1.jpg\"/><image url=\"https://i/2.jpg\"/></images></p>",
        );
        let single = view_of("<p><image>https://i/1.jpg</image></p>");
        let expected = vec!["https://i/1.jpg".to_string(), "https://i/2.jpg".to_string()];

        for node in [&wrapped, &repeated, &attributed] {
            assert_eq!(
                RecordView::new(node).list(&["images", "photos"], &["image", "photo"]),
                expected
            );
        }
        assert_eq!(
            RecordView::new(&single).list(&["images"], &["image", "photo"]),
            vec!["https://i/1.jpg".to_string()]
        );
    }

    #[test]
    fn delimited_feature_text_is_split() {
        let node = view_of("<p><features>Pool, Garden | Solarium</features></p>");
        assert_eq!(
            RecordView::new(&node).list(&["features"], &["feature"]),
            vec!["Pool", "Garden", "Solarium"]
        );
    }

    #[test]
    fn localized_shapes_are_collected() {
        let nested = view_of("<p><desc><en>Sea views</en><es>Vistas</es></desc></p>");
        let attributed = view_of(
            "<p><desc language=\"es\">Vistas</desc><desc language=\"en\">Sea views</desc></p>",
        );
        let flat = view_of("<p><description>Sea views</description></p>");

        let nested_entries = RecordView::new(&nested).localized(&["desc", "description"]);
        assert_eq!(nested_entries[0], ("en".to_string(), "Sea views".to_string()));
        let attributed_entries = RecordView::new(&attributed).localized(&["desc", "description"]);
        assert_eq!(attributed_entries.len(), 2);
        assert_eq!(collapse_localized(&attributed_entries).as_deref(), Some("Sea views"));
        let flat_entries = RecordView::new(&flat).localized(&["desc", "description"]);
        assert_eq!(flat_entries, vec![("en".to_string(), "Sea views".to_string())]);
    }

    #[test]
    fn truthy_flags_and_language_codes() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" Yes "));
        assert!(!is_truthy("0"));
        assert!(is_language_code("en"));
        assert!(is_language_code("pt_BR"));
        assert!(!is_language_code("latitude"));
        assert!(!is_language_code("url"));
        assert!(!is_language_code("id"));
    }

    #[test]
    fn json_records_share_the_same_rules() {
        let item = json!({
            "reference": "BP-7",
            "town": {"en": "Ciudad Quesada", "es": "Ciudad Quesada"},
            "price": 189000,
            "bedrooms": "3",
            "description": {"es": "Piscina", "en": "Pool"},
            "images": [{"url": "https://i/1.jpg"}, "https://i/2.jpg", {"src": "https://i/1.jpg"}],
            "features": "Pool, Garden",
            "location": {"latitude": 38.07}
        });
        let record = JsonRecord::new(&item).unwrap();
        assert_eq!(record.text(&["ref", "reference", "id"]).as_deref(), Some("BP-7"));
        assert_eq!(record.text(&["town"]).as_deref(), Some("Ciudad Quesada"));
        assert_eq!(record.amount(&["price"]), 189000.0);
        assert_eq!(record.count(&["beds", "bedrooms"]), 3);
        assert_eq!(
            record.list(&["images"], &["image"]),
            vec!["https://i/1.jpg", "https://i/2.jpg"]
        );
        assert_eq!(record.list(&["features"], &["feature"]), vec!["Pool", "Garden"]);
        assert_eq!(record.text_at(&["location", "latitude"]).as_deref(), Some("38.07"));
        assert_eq!(
            collapse_localized(&record.localized(&["description"])).as_deref(),
            Some("Pool")
        );
        assert!(JsonRecord::new(&json!("just a string")).is_none());
    }
}
