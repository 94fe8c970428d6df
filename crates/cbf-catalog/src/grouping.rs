//! Partitions listings into developments, builders and areas and computes
//! the per-group aggregates. Nothing here touches the filesystem or network.

use cbf_core::{
    delivery_quarter, parse_delivery_date, slugify, Area, BedroomRange, Builder, Development,
    Listing, ListingStatus, PropertyType, SizeRange,
};
use indexmap::IndexMap;

use crate::gazetteer::AreaEntry;

pub const UNKNOWN_DEVELOPER_KEY: &str = "unknown-developer";
const UNKNOWN_DEVELOPER_NAME: &str = "Unknown developer";
const MAX_DEVELOPMENT_IMAGES: usize = 10;

const POOL_KEYWORDS: &[&str] = &["pool", "piscina", "swimming"];
const GARDEN_KEYWORDS: &[&str] = &["garden", "jardín", "jardin", "landscaped"];
const SEA_VIEW_KEYWORDS: &[&str] = &[
    "sea view",
    "seaview",
    "vista al mar",
    "vistas al mar",
    "mediterranean view",
];
const GOLF_VIEW_KEYWORDS: &[&str] = &["golf view", "golf course", "campo de golf"];

/// What to do with a listing that carries no development name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevelopmentKeyPolicy {
    /// Group by town, property type and rounded price.
    #[default]
    Fallback,
    /// Leave the listing out of development grouping.
    RequireName,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupingConfig {
    pub policy: DevelopmentKeyPolicy,
    /// Width of the price bucket used by the fallback key, in EUR.
    pub price_bucket: f64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            policy: DevelopmentKeyPolicy::Fallback,
            price_bucket: 50_000.0,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn price_bucket(price: f64, width: f64) -> u64 {
    if price <= 0.0 || width <= 0.0 {
        return 0;
    }
    ((price / width).round() * width) as u64
}

pub fn development_key(listing: &Listing, config: &GroupingConfig) -> Option<String> {
    if let Some(name) = non_blank(listing.development_name.as_deref()) {
        return Some(slugify(name));
    }
    match config.policy {
        DevelopmentKeyPolicy::RequireName => None,
        DevelopmentKeyPolicy::Fallback => Some(slugify(&format!(
            "{} {} {}",
            listing.town.trim(),
            listing.property_type.label(),
            price_bucket(listing.price, config.price_bucket)
        ))),
    }
}

pub fn builder_key(listing: &Listing) -> String {
    non_blank(listing.developer_name.as_deref())
        .map(slugify)
        .unwrap_or_else(|| UNKNOWN_DEVELOPER_KEY.to_string())
}

/// Gazetteer area first, then the raw town, then the zone.
pub fn area_key(listing: &Listing) -> Option<String> {
    non_blank(listing.area_slug.as_deref())
        .map(str::to_string)
        .or_else(|| non_blank(Some(listing.town.as_str())).map(slugify))
        .or_else(|| non_blank(Some(listing.zone.as_str())).map(slugify))
}

/// Stores the derived keys on each listing; a listing outside development
/// grouping keeps an empty `development_key`.
pub fn assign_keys(listings: &mut [Listing], config: &GroupingConfig) {
    for listing in listings {
        listing.development_key = development_key(listing, config).unwrap_or_default();
        listing.developer_key = builder_key(listing);
    }
}

/// Listings partitioned by key, in first-seen order.
#[derive(Debug, Default)]
pub struct Grouping<'a> {
    pub developments: IndexMap<String, Vec<&'a Listing>>,
    pub builders: IndexMap<String, Vec<&'a Listing>>,
    pub areas: IndexMap<String, Vec<&'a Listing>>,
    /// Listings with no development key under `RequireName`.
    pub ungrouped: Vec<&'a Listing>,
}

pub fn group_listings<'a>(listings: &'a [Listing], config: &GroupingConfig) -> Grouping<'a> {
    let mut grouping = Grouping::default();
    for listing in listings {
        match development_key(listing, config) {
            Some(key) => grouping.developments.entry(key).or_default().push(listing),
            None => grouping.ungrouped.push(listing),
        }
        grouping
            .builders
            .entry(builder_key(listing))
            .or_default()
            .push(listing);
        if let Some(key) = area_key(listing) {
            grouping.areas.entry(key).or_default().push(listing);
        }
    }
    grouping
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn first_text<'a>(listings: &[&'a Listing], field: impl Fn(&'a Listing) -> &'a str) -> String {
    listings
        .iter()
        .map(|l| field(*l).trim())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Min and max over positive prices; `None` when nothing is priced.
pub fn price_range<'a>(
    listings: impl IntoIterator<Item = &'a Listing>,
) -> (Option<f64>, Option<f64>) {
    listings
        .into_iter()
        .filter_map(Listing::asking_price)
        .fold((None, None), |(lo, hi), p| {
            (
                Some(lo.map_or(p, |lo: f64| lo.min(p))),
                Some(hi.map_or(p, |hi: f64| hi.max(p))),
            )
        })
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn plural_label(ty: &PropertyType) -> String {
    match ty {
        PropertyType::Apartment => "Apartments".to_string(),
        PropertyType::Penthouse => "Penthouses".to_string(),
        PropertyType::Villa => "Villas".to_string(),
        PropertyType::Townhouse => "Townhouses".to_string(),
        PropertyType::Bungalow => "Bungalows".to_string(),
        PropertyType::Duplex => "Duplexes".to_string(),
        PropertyType::Other(raw) => raw.trim().to_string(),
    }
}

/// Aggregates one development group. `listings` must be non-empty.
pub fn build_development(slug: &str, listings: &[&Listing]) -> Development {
    let town = first_text(listings, |l| l.town.as_str());
    let name = listings
        .iter()
        .find_map(|l| non_blank(l.development_name.as_deref()))
        .map(str::to_string)
        .unwrap_or_else(|| {
            let label = listings
                .first()
                .map(|l| plural_label(&l.property_type))
                .unwrap_or_else(|| "Properties".to_string());
            if town.is_empty() {
                label
            } else {
                format!("{label} in {town}")
            }
        });
    let developer = listings
        .iter()
        .find_map(|l| non_blank(l.developer_name.as_deref()))
        .unwrap_or(UNKNOWN_DEVELOPER_NAME)
        .to_string();
    let developer_slug = listings
        .iter()
        .find(|l| non_blank(l.developer_name.as_deref()).is_some())
        .map(|l| builder_key(l))
        .unwrap_or_else(|| UNKNOWN_DEVELOPER_KEY.to_string());

    let (price_from, price_to) = price_range(listings.iter().copied());
    let bedroom_range = BedroomRange {
        min: listings.iter().map(|l| l.bedrooms).min().unwrap_or(0),
        max: listings.iter().map(|l| l.bedrooms).max().unwrap_or(0),
    };
    let sizes: Vec<f64> = listings
        .iter()
        .map(|l| l.built_area)
        .filter(|a| *a > 0.0)
        .collect();
    let size_range = (!sizes.is_empty()).then(|| SizeRange {
        min: sizes.iter().copied().fold(f64::INFINITY, f64::min),
        max: sizes.iter().copied().fold(0.0, f64::max),
    });

    let mut property_types = Vec::new();
    let mut statuses = Vec::new();
    let mut images: Vec<String> = Vec::new();
    let mut unit_references = Vec::new();
    for listing in listings {
        push_unique(&mut property_types, listing.property_type.clone());
        push_unique(&mut statuses, listing.effective_status());
        for image in listing.images.iter().map(|i| i.trim()).filter(|i| !i.is_empty()) {
            if images.len() < MAX_DEVELOPMENT_IMAGES && !images.iter().any(|i| i == image) {
                images.push(image.to_string());
            }
        }
        unit_references.push(listing.reference.clone());
    }

    let completion_date = listings
        .iter()
        .find_map(|l| non_blank(l.completion_date.as_deref()))
        .map(str::to_string);
    let delivery_quarter = completion_date
        .as_deref()
        .and_then(parse_delivery_date)
        .map(delivery_quarter);

    let text: String = listings
        .iter()
        .map(|l| l.searchable_text())
        .collect::<Vec<_>>()
        .join(" ");
    let zone = first_text(listings, |l| l.zone.as_str());
    let golf_in_name = name.to_lowercase().contains("golf") || zone.to_lowercase().contains("golf");

    Development {
        slug: slug.to_string(),
        name,
        developer,
        developer_slug,
        town,
        zone,
        province: first_text(listings, |l| l.province.as_str()),
        region: first_text(listings, |l| l.region.as_str()),
        area_slug: listings.iter().find_map(|l| l.area_slug.clone()),
        price_from,
        price_to,
        bedroom_range,
        size_range,
        property_types,
        statuses,
        total_units: listings.len(),
        available_units: listings
            .iter()
            .filter(|l| l.effective_status() != ListingStatus::Sold)
            .count(),
        main_image: listings
            .iter()
            .find_map(|l| l.primary_image())
            .map(str::to_string),
        images,
        unit_references,
        completion_date,
        delivery_quarter,
        has_pool: listings.iter().any(|l| l.has_pool) || contains_any(&text, POOL_KEYWORDS),
        has_sea_view: contains_any(&text, SEA_VIEW_KEYWORDS),
        has_golf_view: golf_in_name || contains_any(&text, GOLF_VIEW_KEYWORDS),
        has_garden: contains_any(&text, GARDEN_KEYWORDS),
    }
}

pub fn build_builder(slug: &str, listings: &[&Listing], config: &GroupingConfig) -> Builder {
    let mut development_slugs = Vec::new();
    let mut towns = Vec::new();
    let mut regions = Vec::new();
    for listing in listings {
        if let Some(key) = development_key(listing, config) {
            push_unique(&mut development_slugs, key);
        }
        if let Some(town) = non_blank(Some(listing.town.as_str())) {
            push_unique(&mut towns, town.to_string());
        }
        if let Some(region) = non_blank(Some(listing.region.as_str())) {
            push_unique(&mut regions, region.to_string());
        }
    }
    let (price_from, price_to) = price_range(listings.iter().copied());
    Builder {
        slug: slug.to_string(),
        name: listings
            .iter()
            .find_map(|l| non_blank(l.developer_name.as_deref()))
            .unwrap_or(UNKNOWN_DEVELOPER_NAME)
            .to_string(),
        development_count: development_slugs.len(),
        development_slugs,
        property_count: listings.len(),
        price_from,
        price_to,
        towns,
        regions,
    }
}

/// `entry` is the gazetteer record when the key is a resolved area slug.
pub fn build_area(
    slug: &str,
    listings: &[&Listing],
    entry: Option<&AreaEntry>,
    config: &GroupingConfig,
) -> Area {
    let mut development_slugs = Vec::new();
    let mut property_types = Vec::new();
    for listing in listings {
        if let Some(key) = development_key(listing, config) {
            push_unique(&mut development_slugs, key);
        }
        push_unique(&mut property_types, listing.property_type.clone());
    }
    let (price_from, price_to) = price_range(listings.iter().copied());
    let name = match entry {
        Some(area) => area.name.clone(),
        None => {
            let town = first_text(listings, |l| l.town.as_str());
            if town.is_empty() {
                first_text(listings, |l| l.zone.as_str())
            } else {
                town
            }
        }
    };
    Area {
        slug: slug.to_string(),
        name,
        region: entry
            .map(|a| a.region.clone())
            .unwrap_or_else(|| first_text(listings, |l| l.region.as_str())),
        development_slugs,
        property_count: listings.len(),
        property_types,
        price_from,
        price_to,
    }
}

pub(crate) fn contains_token_run(haystack: &str, needle: &str) -> bool {
    !needle.is_empty() && format!("-{haystack}-").contains(&format!("-{needle}-"))
}

/// Token-level text match between an area and a development location, in
/// either direction. Used only where the gazetteer resolved nothing.
pub fn matches_area_text(area_name: &str, area_slug: &str, town: &str, zone: &str) -> bool {
    let needles = [slugify(area_name.trim()), area_slug.to_string()];
    let hays = [slugify(town.trim()), slugify(zone.trim())];
    needles.iter().filter(|n| !n.is_empty()).any(|needle| {
        hays.iter()
            .filter(|h| !h.is_empty())
            .any(|hay| contains_token_run(hay, needle) || contains_token_run(needle, hay))
    })
}
