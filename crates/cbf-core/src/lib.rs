//! Canonical listing model and derived aggregates for CBF.

use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "cbf-core";

/// Sales status of a single unit, normalised from vendor wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    KeyReady,
    #[serde(rename = "completion-3-months")]
    Completion3Months,
    UnderConstruction,
    OffPlan,
    Sold,
}

impl ListingStatus {
    /// Maps free vendor text (English or Spanish) to a status. Blank input
    /// yields `None`; unrecognised wording counts as under construction.
    pub fn from_vendor(text: &str) -> Option<Self> {
        let lower = text.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        let status = if lower.contains("key")
            || lower.contains("ready")
            || lower.contains("llave")
        {
            Self::KeyReady
        } else if lower.contains("sold") || lower.contains("vendid") {
            Self::Sold
        } else if lower.contains("off-plan")
            || lower.contains("off plan")
            || lower.contains("plano")
        {
            Self::OffPlan
        } else if lower.contains("3 month")
            || lower.contains("3-month")
            || lower.contains("próxima")
            || lower.contains("proxima")
        {
            Self::Completion3Months
        } else {
            Self::UnderConstruction
        };
        Some(status)
    }

    /// Derives a status from a delivery date: delivered or due within 30 days
    /// is key-ready, more than 18 months out is off-plan.
    pub fn from_delivery_date(delivery: NaiveDate, today: NaiveDate) -> Self {
        if delivery <= today + Duration::days(30) {
            Self::KeyReady
        } else if delivery > today + Duration::days(18 * 30) {
            Self::OffPlan
        } else {
            Self::UnderConstruction
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyReady => "key-ready",
            Self::Completion3Months => "completion-3-months",
            Self::UnderConstruction => "under-construction",
            Self::OffPlan => "off-plan",
            Self::Sold => "sold",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised property type. Vendor values outside the known set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyType {
    Apartment,
    Penthouse,
    Villa,
    Townhouse,
    Bungalow,
    Duplex,
    Other(String),
}

const PROPERTY_TYPE_ALIASES: &[(&str, PropertyType)] = &[
    ("apartment", PropertyType::Apartment),
    ("apartments", PropertyType::Apartment),
    ("apartamento", PropertyType::Apartment),
    ("piso", PropertyType::Apartment),
    ("flat", PropertyType::Apartment),
    ("penthouse", PropertyType::Penthouse),
    ("atico", PropertyType::Penthouse),
    ("ático", PropertyType::Penthouse),
    ("villa", PropertyType::Villa),
    ("villas", PropertyType::Villa),
    ("detached villa", PropertyType::Villa),
    ("chalet", PropertyType::Villa),
    ("townhouse", PropertyType::Townhouse),
    ("town house", PropertyType::Townhouse),
    ("adosado", PropertyType::Townhouse),
    ("terraced", PropertyType::Townhouse),
    ("bungalow", PropertyType::Bungalow),
    ("duplex", PropertyType::Duplex),
    ("dúplex", PropertyType::Duplex),
];

// Checked in order; more specific words first.
const PROPERTY_TYPE_FRAGMENTS: &[(&str, PropertyType)] = &[
    ("penthouse", PropertyType::Penthouse),
    ("atico", PropertyType::Penthouse),
    ("ático", PropertyType::Penthouse),
    ("duplex", PropertyType::Duplex),
    ("dúplex", PropertyType::Duplex),
    ("bungalow", PropertyType::Bungalow),
    ("townhouse", PropertyType::Townhouse),
    ("town house", PropertyType::Townhouse),
    ("adosad", PropertyType::Townhouse),
    ("villa", PropertyType::Villa),
    ("chalet", PropertyType::Villa),
    ("apartment", PropertyType::Apartment),
    ("apartamento", PropertyType::Apartment),
];

impl PropertyType {
    /// Maps vendor text to a type. Missing text defaults to apartment, the
    /// dominant unit type in the feeds.
    pub fn from_vendor(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::Apartment;
        }
        let lower = trimmed.to_lowercase();
        if let Some((_, ty)) = PROPERTY_TYPE_ALIASES.iter().find(|(alias, _)| *alias == lower) {
            return ty.clone();
        }
        if let Some((_, ty)) = PROPERTY_TYPE_FRAGMENTS
            .iter()
            .find(|(fragment, _)| lower.contains(fragment))
        {
            return ty.clone();
        }
        Self::Other(trimmed.to_string())
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Apartment => "apartment",
            Self::Penthouse => "penthouse",
            Self::Villa => "villa",
            Self::Townhouse => "townhouse",
            Self::Bungalow => "bungalow",
            Self::Duplex => "duplex",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for PropertyType {
    fn from(value: String) -> Self {
        Self::from_vendor(&value)
    }
}

impl From<PropertyType> for String {
    fn from(value: PropertyType) -> Self {
        value.label().to_string()
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Vendor-reported distances in kilometres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distances {
    pub beach_km: Option<f64>,
    pub airport_km: Option<f64>,
    pub golf_km: Option<f64>,
}

/// One normalised unit from one feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub reference: String,
    pub source_id: String,
    pub title: String,
    pub description: String,
    /// Language code to text, in document order.
    pub descriptions: Vec<(String, String)>,
    /// EUR. Zero means price on request.
    pub price: f64,
    pub currency: String,
    pub property_type: PropertyType,
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub built_area: f64,
    pub plot_area: f64,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub town: String,
    pub province: String,
    pub zone: String,
    pub location_detail: String,
    pub region: String,
    pub area_slug: Option<String>,
    pub development_name: Option<String>,
    pub developer_name: Option<String>,
    pub development_key: String,
    pub developer_key: String,
    pub status: Option<ListingStatus>,
    pub completion_date: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub distances: Distances,
    pub is_new_build: bool,
    pub has_pool: bool,
    pub external_url: Option<String>,
}

impl Listing {
    /// Blank listing carrying only identity; adapters fill the rest.
    pub fn new(source_id: &str, id_prefix: &str, reference: &str) -> Self {
        Self {
            id: format!("{id_prefix}{reference}"),
            reference: reference.to_string(),
            source_id: source_id.to_string(),
            title: String::new(),
            description: String::new(),
            descriptions: Vec::new(),
            price: 0.0,
            currency: "EUR".to_string(),
            property_type: PropertyType::Apartment,
            bedrooms: 0,
            bathrooms: 0,
            built_area: 0.0,
            plot_area: 0.0,
            images: Vec::new(),
            features: Vec::new(),
            town: String::new(),
            province: String::new(),
            zone: String::new(),
            location_detail: String::new(),
            region: String::new(),
            area_slug: None,
            development_name: None,
            developer_name: None,
            development_key: String::new(),
            developer_key: String::new(),
            status: None,
            completion_date: None,
            coordinates: None,
            distances: Distances::default(),
            is_new_build: false,
            has_pool: false,
            external_url: None,
        }
    }

    /// Positive price, or `None` for price on request.
    pub fn asking_price(&self) -> Option<f64> {
        (self.price > 0.0).then_some(self.price)
    }

    pub fn effective_status(&self) -> ListingStatus {
        self.status.unwrap_or(ListingStatus::UnderConstruction)
    }

    pub fn primary_image(&self) -> Option<&str> {
        self.images
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }

    /// Lower-cased features joined with the description, for keyword rules.
    pub fn searchable_text(&self) -> String {
        let mut text = self.features.join(" ");
        text.push(' ');
        text.push_str(&self.description);
        text.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BedroomRange {
    pub min: u32,
    pub max: u32,
}

impl fmt::Display for BedroomRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: f64,
    pub max: f64,
}

/// Listings believed to belong to one building project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Development {
    pub slug: String,
    pub name: String,
    pub developer: String,
    pub developer_slug: String,
    pub town: String,
    pub zone: String,
    pub province: String,
    pub region: String,
    pub area_slug: Option<String>,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
    pub bedroom_range: BedroomRange,
    pub size_range: Option<SizeRange>,
    pub property_types: Vec<PropertyType>,
    pub statuses: Vec<ListingStatus>,
    pub total_units: usize,
    pub available_units: usize,
    pub main_image: Option<String>,
    pub images: Vec<String>,
    pub unit_references: Vec<String>,
    pub completion_date: Option<String>,
    pub delivery_quarter: Option<String>,
    pub has_pool: bool,
    pub has_sea_view: bool,
    pub has_golf_view: bool,
    pub has_garden: bool,
}

impl Development {
    /// The status shown for the project as a whole: the least advanced unit wins.
    pub fn headline_status(&self) -> ListingStatus {
        for candidate in [
            ListingStatus::OffPlan,
            ListingStatus::UnderConstruction,
            ListingStatus::Completion3Months,
            ListingStatus::KeyReady,
        ] {
            if self.statuses.contains(&candidate) {
                return candidate;
            }
        }
        self.statuses
            .first()
            .copied()
            .unwrap_or(ListingStatus::UnderConstruction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Builder {
    pub slug: String,
    pub name: String,
    pub development_slugs: Vec<String>,
    pub development_count: usize,
    pub property_count: usize,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
    pub towns: Vec<String>,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub slug: String,
    pub name: String,
    pub region: String,
    pub development_slugs: Vec<String>,
    pub property_count: usize,
    pub property_types: Vec<PropertyType>,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_developments: usize,
    pub total_properties: usize,
    pub total_areas: usize,
    pub total_builders: usize,
    /// Lowest positive development price, 0 when none is known.
    pub price_from: f64,
    pub price_to: f64,
    pub average_price: f64,
    pub key_ready_count: usize,
    pub under_construction_count: usize,
    pub off_plan_count: usize,
}

fn slug_body(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_hyphen = false;
    for ch in lowered.nfd().filter(|c| !is_combining_mark(*c)) {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// URL-safe identifier shared by development, builder and area keys.
///
/// Lower-cases, strips diacritics, collapses every run of non-alphanumeric
/// characters to one hyphen and trims hyphens. Input without any
/// alphanumeric character maps to a hex-derived slug so that non-empty input
/// never yields an empty key. The output is a fixed point of the function.
pub fn slugify(input: &str) -> String {
    let slug = slug_body(input);
    if slug.is_empty() && !input.is_empty() {
        let mut hexed = hex::encode(input.as_bytes());
        hexed.truncate(32);
        return format!("u{hexed}");
    }
    slug
}

/// Slug tokens of a free-text location, used for token-level matching.
pub fn slug_tokens(input: &str) -> Vec<String> {
    slug_body(input)
        .split('-')
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Lenient numeric parse for vendor fields. Empty, non-numeric, negative or
/// non-finite input yields 0.
pub fn parse_amount(text: &str) -> f64 {
    let chars: Vec<char> = text.trim().chars().collect();
    let mut token = String::new();
    let mut negative = false;
    let mut prev: Option<char> = None;
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            if token.is_empty() && prev == Some('-') {
                negative = true;
            }
            token.push(ch);
        } else if (ch == '.' || ch == ',') && !token.is_empty() {
            token.push(ch);
        } else if is_space_group_separator(&chars, i, &token) {
            // "250 000" and "250\u{a0}000": the space is a thousands separator.
        } else if !token.is_empty() {
            break;
        }
        prev = Some(ch);
    }
    if negative {
        return 0.0;
    }
    let token = token.trim_end_matches(['.', ',']);
    if token.is_empty() {
        return 0.0;
    }

    let normalized = match (token.rfind('.'), token.rfind(',')) {
        (Some(dot), Some(comma)) => {
            // Whichever separator comes last is the decimal mark.
            if dot > comma {
                token.replace(',', "")
            } else {
                token.replace('.', "").replace(',', ".")
            }
        }
        (Some(_), None) => normalize_single_separator(token, '.'),
        (None, Some(_)) => normalize_single_separator(token, ','),
        (None, None) => token.to_string(),
    };

    match normalized.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => v,
        _ => 0.0,
    }
}

/// A space or no-break space sitting between a digit and exactly three
/// digits, as in "1 250 000".
fn is_space_group_separator(chars: &[char], at: usize, token: &str) -> bool {
    if !matches!(chars[at], ' ' | '\u{a0}' | '\u{202f}') {
        return false;
    }
    if !token.ends_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    let group = &chars[at + 1..];
    group.len() >= 3
        && group[..3].iter().all(char::is_ascii_digit)
        && !group.get(3).is_some_and(char::is_ascii_digit)
}

fn normalize_single_separator(token: &str, sep: char) -> String {
    let parts: Vec<&str> = token.split(sep).collect();
    if parts.len() > 2 {
        return parts.concat();
    }
    let (head, tail) = (parts[0], parts[1]);
    let is_grouping = tail.len() == 3 && !head.is_empty() && head.len() <= 3 && head != "0";
    if is_grouping {
        format!("{head}{tail}")
    } else {
        format!("{head}.{tail}")
    }
}

/// Whole non-negative count (bedrooms, bathrooms).
pub fn parse_count(text: &str) -> u32 {
    let value = parse_amount(text).floor();
    if value >= u32::MAX as f64 {
        u32::MAX
    } else {
        value as u32
    }
}

/// Collapses a localized value to one display string: English first, then
/// the first non-empty entry in document order.
pub fn collapse_localized(entries: &[(String, String)]) -> Option<String> {
    let non_empty = |text: &String| {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    entries
        .iter()
        .filter(|(lang, _)| lang.eq_ignore_ascii_case("en"))
        .find_map(|(_, text)| non_empty(text))
        .or_else(|| entries.iter().find_map(|(_, text)| non_empty(text)))
}

pub fn parse_delivery_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// "Q2 2026" style label for a delivery date.
pub fn delivery_quarter(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("Q{} {}", (date.month() - 1) / 3 + 1, date.year())
}

pub fn format_price_eur(price: f64) -> String {
    let whole = price.round() as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    format!("€{out}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_accents_and_collapses_separators() {
        assert_eq!(slugify("Jávea / Xàbia"), "javea-xabia");
        assert_eq!(slugify("  GOMERA   STAR  "), "gomera-star");
        assert_eq!(slugify("Doña Pepa -- Golf!!"), "dona-pepa-golf");
        assert_eq!(slugify("torrevieja "), slugify("Torrevieja"));
    }

    #[test]
    fn slugify_is_idempotent() {
        for raw in [
            "Residencial Élite III",
            "l'Alfàs del Pi",
            "  ",
            "!!!",
            "ÁTICO-ÁTICO",
            "Ciudad Quesada",
            "Smørrebrød",
        ] {
            let once = slugify(raw);
            assert_eq!(slugify(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn slugify_is_non_empty_for_non_empty_input() {
        assert!(!slugify("!!!").is_empty());
        assert!(!slugify(" ").is_empty());
        assert_eq!(slugify(""), "");
        assert_ne!(slugify("!!!"), slugify("???"));
    }

    #[test]
    fn parse_amount_tolerates_vendor_noise() {
        assert_eq!(parse_amount("abc"), 0.0);
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("250000"), 250000.0);
        assert_eq!(parse_amount("€ 1.250.000"), 1_250_000.0);
        assert_eq!(parse_amount("249,900"), 249_900.0);
        assert_eq!(parse_amount("1.234,50"), 1234.5);
        assert_eq!(parse_amount("85 m2"), 85.0);
        assert_eq!(parse_amount("250 000"), 250_000.0);
        assert_eq!(parse_amount("1 250 000 €"), 1_250_000.0);
        assert_eq!(parse_amount("250\u{a0}000"), 250_000.0);
        assert_eq!(parse_amount("€ 1\u{a0}250\u{a0}000,50"), 1_250_000.5);
        assert_eq!(parse_amount("120 2500"), 120.0);
        assert_eq!(parse_amount("3.5"), 3.5);
        assert_eq!(parse_amount("-5"), 0.0);
        assert_eq!(parse_count("2.0"), 2);
        assert_eq!(parse_count("three"), 0);
    }

    #[test]
    fn property_type_maps_known_aliases_and_passes_through_unknown() {
        assert_eq!(PropertyType::from_vendor("Apartamento"), PropertyType::Apartment);
        assert_eq!(PropertyType::from_vendor("Ático"), PropertyType::Penthouse);
        assert_eq!(PropertyType::from_vendor("Detached Villa"), PropertyType::Villa);
        assert_eq!(PropertyType::from_vendor("Ground floor apartment"), PropertyType::Apartment);
        assert_eq!(
            PropertyType::from_vendor("Semi-Detached"),
            PropertyType::Other("Semi-Detached".into())
        );
        assert_eq!(PropertyType::from_vendor(""), PropertyType::Apartment);
    }

    #[test]
    fn property_type_serializes_as_label() {
        let json =
            serde_json::to_string(&vec![PropertyType::Villa, PropertyType::Other("Finca".into())])
                .unwrap();
        assert_eq!(json, r#"["villa","Finca"]"#);
        let back: Vec<PropertyType> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![PropertyType::Villa, PropertyType::Other("Finca".into())]);
    }

    #[test]
    fn status_from_vendor_text() {
        assert_eq!(ListingStatus::from_vendor("Key Ready"), Some(ListingStatus::KeyReady));
        assert_eq!(ListingStatus::from_vendor("Llave en mano"), Some(ListingStatus::KeyReady));
        assert_eq!(ListingStatus::from_vendor("VENDIDO"), Some(ListingStatus::Sold));
        assert_eq!(ListingStatus::from_vendor("sobre plano"), Some(ListingStatus::OffPlan));
        assert_eq!(
            ListingStatus::from_vendor("Completion in 3 months"),
            Some(ListingStatus::Completion3Months)
        );
        assert_eq!(ListingStatus::from_vendor("building"), Some(ListingStatus::UnderConstruction));
        assert_eq!(ListingStatus::from_vendor("  "), None);
        assert_eq!(
            serde_json::to_string(&ListingStatus::Completion3Months).unwrap(),
            "\"completion-3-months\""
        );
    }

    #[test]
    fn delivery_dates_drive_status_and_quarter() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let soon = parse_delivery_date("01-02-2026").unwrap();
        let mid = parse_delivery_date("2026-09-30").unwrap();
        let far = parse_delivery_date("30/12/2028").unwrap();
        assert_eq!(ListingStatus::from_delivery_date(soon, today), ListingStatus::KeyReady);
        assert_eq!(ListingStatus::from_delivery_date(mid, today), ListingStatus::UnderConstruction);
        assert_eq!(ListingStatus::from_delivery_date(far, today), ListingStatus::OffPlan);
        assert_eq!(delivery_quarter(mid), "Q3 2026");
        assert!(parse_delivery_date("soon").is_none());
    }

    #[test]
    fn collapse_localized_prefers_english() {
        let entries = vec![
            ("es".to_string(), "Piso".to_string()),
            ("en".to_string(), " Flat ".to_string()),
        ];
        assert_eq!(collapse_localized(&entries).as_deref(), Some("Flat"));
        let no_en = vec![
            ("de".to_string(), "".to_string()),
            ("nl".to_string(), "Appartement".to_string()),
        ];
        assert_eq!(collapse_localized(&no_en).as_deref(), Some("Appartement"));
        assert_eq!(collapse_localized(&[]), None);
    }

    #[test]
    fn price_formatting_groups_thousands() {
        assert_eq!(format_price_eur(274_900.0), "€274,900");
        assert_eq!(format_price_eur(999.0), "€999");
    }

    #[test]
    fn listing_helpers() {
        let mut listing = Listing::new("redsp", "redsp-", "N100");
        assert_eq!(listing.id, "redsp-N100");
        assert_eq!(listing.asking_price(), None);
        listing.images = vec!["  ".into(), "https://img/1.jpg".into()];
        assert_eq!(listing.primary_image(), Some("https://img/1.jpg"));
        assert_eq!(listing.effective_status(), ListingStatus::UnderConstruction);
    }
}
