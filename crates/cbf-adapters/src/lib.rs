//! Feed adapter contracts + vendor feed normalizers.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cbf_core::{
    collapse_localized, Coordinates, Distances, Listing, ListingStatus, PropertyType,
};
use cbf_fetch::{FeedFetcher, FeedRequest, FetchError, FetchedFeed};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod record;
pub mod xml;

pub use record::{FieldSource, JsonRecord, RecordView};
pub use xml::{split_records, FragmentError, RawRecord, XmlNode};

pub const CRATE_NAME: &str = "cbf-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    /// Kyero v3 XML (REDSP general feed).
    Kyero,
    /// `<properties><property>` export carrying development, developer and status.
    Legacy,
    /// Sooprema export; served as XML or JSON depending on the endpoint.
    Sooprema,
    Json,
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kyero => "kyero",
            Self::Legacy => "legacy",
            Self::Sooprema => "sooprema",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

/// Document-level failure. Single bad records never surface here.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why one record was left out of a parse.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("record has no reference")]
    MissingReference,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("record is not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Parsed(Listing),
    Skipped(SkipReason),
}

impl From<Result<Listing, SkipReason>> for RecordOutcome {
    fn from(value: Result<Listing, SkipReason>) -> Self {
        match value {
            Ok(listing) => Self::Parsed(listing),
            Err(reason) => Self::Skipped(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: SkipReason,
}

/// Listings in document order plus every record that was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParseReport {
    pub source_id: String,
    pub listings: Vec<Listing>,
    pub skipped: Vec<SkippedRecord>,
}

impl ParseReport {
    pub fn from_outcomes(
        source_id: &str,
        outcomes: impl IntoIterator<Item = (usize, RecordOutcome)>,
    ) -> Self {
        let mut report = Self {
            source_id: source_id.to_string(),
            ..Self::default()
        };
        for (index, outcome) in outcomes {
            match outcome {
                RecordOutcome::Parsed(listing) => report.listings.push(listing),
                RecordOutcome::Skipped(reason) => {
                    warn!(source_id, index, %reason, "skipping feed record");
                    report.skipped.push(SkippedRecord { index, reason });
                }
            }
        }
        info!(
            source_id,
            parsed = report.listings.len(),
            skipped = report.skipped.len(),
            "feed parsed"
        );
        report
    }

    pub fn records_seen(&self) -> usize {
        self.listings.len() + self.skipped.len()
    }

    /// Drops resale stock; returns how many listings were removed.
    pub fn retain_new_builds(&mut self) -> usize {
        let before = self.listings.len();
        self.listings.retain(|l| l.is_new_build);
        before - self.listings.len()
    }
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn format(&self) -> FeedFormat;

    async fn fetch(
        &self,
        http: &FeedFetcher,
        ctx: &AdapterContext,
        request: &FeedRequest,
    ) -> Result<FetchedFeed, AdapterError> {
        Ok(http.fetch(ctx.run_id, request).await?)
    }

    fn parse(&self, document: &str) -> Result<ParseReport, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterIdentity {
    pub source_id: String,
    pub id_prefix: String,
}

impl AdapterIdentity {
    pub fn new(source_id: impl Into<String>, id_prefix: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            id_prefix: id_prefix.into(),
        }
    }
}

/// Per-vendor knobs on top of the shared alias tables.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    pub record_tags: &'static [&'static str],
    pub new_build_flags: &'static [&'static str],
    /// Feed only carries new builds, whatever the flags say.
    pub assume_new_build: bool,
}

pub const KYERO_DIALECT: Dialect = Dialect {
    record_tags: &["property"],
    new_build_flags: &["new_build"],
    assume_new_build: false,
};

pub const LEGACY_DIALECT: Dialect = Dialect {
    record_tags: &["property"],
    new_build_flags: &["new_build"],
    assume_new_build: true,
};

pub const SOOPREMA_DIALECT: Dialect = Dialect {
    record_tags: &["property", "listing"],
    new_build_flags: &["saleType", "sale_type", "new_build"],
    assume_new_build: false,
};

pub const JSON_DIALECT: Dialect = Dialect {
    record_tags: &[],
    new_build_flags: &["new_build", "newBuild", "saleType"],
    assume_new_build: false,
};

const REFERENCE: &[&str] = &["ref", "reference", "id"];
const TITLE: &[&str] = &["title", "name", "headline"];
const PRICE: &[&str] = &["price", "sale_price"];
const CURRENCY: &[&str] = &["currency"];
const PROPERTY_TYPE: &[&str] = &["type", "property_type"];
const TOWN: &[&str] = &["town", "location", "city"];
const PROVINCE: &[&str] = &["province"];
const ZONE: &[&str] = &["zone", "urbanisation"];
const LOCATION_DETAIL: &[&str] = &["location_detail"];
const REGION: &[&str] = &["region"];
const BEDROOMS: &[&str] = &["beds", "bedrooms", "rooms"];
const BATHROOMS: &[&str] = &["baths", "bathrooms"];
const BUILT: &[&str] = &["built", "built_area", "built_size", "size"];
const PLOT: &[&str] = &["plot", "plot_area", "plot_size"];
const DESCRIPTION: &[&str] = &["desc", "description"];
const IMAGE_WRAPPERS: &[&str] = &["images", "photos"];
const IMAGE_ITEMS: &[&str] = &["image", "photo"];
const FEATURE_WRAPPERS: &[&str] = &["features"];
const FEATURE_ITEMS: &[&str] = &["feature"];
const DEVELOPMENT: &[&str] = &["development", "development_name", "promotion"];
const DEVELOPER: &[&str] = &["developer", "builder", "promoter"];
const STATUS: &[&str] = &["status"];
const COMPLETION: &[&str] = &["completion_date", "delivery_date", "key_date"];
const LATITUDE: &[&str] = &["latitude", "lat"];
const LONGITUDE: &[&str] = &["longitude", "lng", "lon"];
const DISTANCE_BEACH: &[&str] = &["distance_beach", "beach_distance"];
const DISTANCE_AIRPORT: &[&str] = &["distance_airport", "airport_distance"];
const DISTANCE_GOLF: &[&str] = &["distance_golf", "golf_distance"];
const POOL: &[&str] = &["pool"];
const EXTERNAL_URL: &[&str] = &["url", "external_url", "link"];

/// Builds one canonical listing from any record shape.
pub fn normalize_record<S: FieldSource>(
    src: &S,
    identity: &AdapterIdentity,
    dialect: &Dialect,
) -> Result<Listing, SkipReason> {
    let reference = src.text(REFERENCE).ok_or(SkipReason::MissingReference)?;
    let mut listing = Listing::new(&identity.source_id, &identity.id_prefix, &reference);

    listing.property_type = PropertyType::from_vendor(&src.text(PROPERTY_TYPE).unwrap_or_default());
    listing.town = src.text(TOWN).unwrap_or_default();
    listing.province = src.text(PROVINCE).unwrap_or_default();
    listing.zone = src.text(ZONE).unwrap_or_default();
    listing.location_detail = src.text(LOCATION_DETAIL).unwrap_or_default();
    listing.region = src.text(REGION).unwrap_or_default();

    listing.price = src.amount(PRICE);
    if let Some(currency) = src.text(CURRENCY) {
        listing.currency = currency.to_ascii_uppercase();
    }
    listing.bedrooms = src.count(BEDROOMS);
    listing.bathrooms = src.count(BATHROOMS);
    listing.built_area =
        positive_at(src, &["surface_area", "built"]).unwrap_or_else(|| src.amount(BUILT));
    listing.plot_area =
        positive_at(src, &["surface_area", "plot"]).unwrap_or_else(|| src.amount(PLOT));

    listing.descriptions = src.localized(DESCRIPTION);
    listing.description = collapse_localized(&listing.descriptions).unwrap_or_default();
    listing.images = src
        .list(IMAGE_WRAPPERS, IMAGE_ITEMS)
        .into_iter()
        .filter_map(|url| absolute_url(&url))
        .collect();
    listing.features = src.list(FEATURE_WRAPPERS, FEATURE_ITEMS);

    listing.development_name = src.text(DEVELOPMENT);
    listing.developer_name = src.text(DEVELOPER);
    listing.status = src.text(STATUS).and_then(|s| ListingStatus::from_vendor(&s));
    listing.completion_date = src.text(COMPLETION);

    listing.coordinates = coordinates(src);
    listing.distances = Distances {
        beach_km: src.positive(DISTANCE_BEACH),
        airport_km: src.positive(DISTANCE_AIRPORT),
        golf_km: src.positive(DISTANCE_GOLF),
    };

    listing.is_new_build = dialect.assume_new_build || src.flag(dialect.new_build_flags);
    listing.has_pool = src.flag(POOL) || {
        let text = listing.features.join(" ").to_lowercase();
        text.contains("pool") || text.contains("piscina")
    };
    listing.external_url = src.text(EXTERNAL_URL).and_then(|u| absolute_url(&u));
    listing.title = src.text(TITLE).unwrap_or_else(|| default_title(&listing));

    Ok(listing)
}

/// `http(s)` URLs pass through; protocol-relative ones get `https:`.
fn absolute_url(url: &str) -> Option<String> {
    if url.starts_with("//") {
        Some(format!("https:{url}"))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.to_string())
    } else {
        None
    }
}

fn positive_at<S: FieldSource>(src: &S, path: &[&str]) -> Option<f64> {
    src.text_at(path)
        .map(|t| cbf_core::parse_amount(&t))
        .filter(|v| *v > 0.0)
}

fn coordinates<S: FieldSource>(src: &S) -> Option<Coordinates> {
    let read = |nested: [&str; 2], flat: &[&str]| {
        src.text_at(&nested)
            .or_else(|| src.text(flat))
            .and_then(|t| t.trim().replace(',', ".").parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };
    let lat = read(["location", "latitude"], LATITUDE)?;
    let lng = read(["location", "longitude"], LONGITUDE)?;
    if lat == 0.0 && lng == 0.0 {
        return None;
    }
    Some(Coordinates { lat, lng })
}

fn default_title(listing: &Listing) -> String {
    let label = listing.property_type.label();
    let mut kind = String::with_capacity(label.len());
    let mut chars = label.chars();
    if let Some(first) = chars.next() {
        kind.extend(first.to_uppercase());
        kind.push_str(chars.as_str());
    }
    if listing.town.is_empty() {
        format!("{kind} {}", listing.reference)
    } else {
        format!("{kind} in {}", listing.town)
    }
}

fn strip_bom(document: &str) -> &str {
    document.trim_start_matches('\u{feff}').trim()
}

/// True when the body looks like JSON rather than XML.
pub fn sniff_json(document: &str) -> bool {
    let trimmed = strip_bom(document);
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

pub fn parse_xml_document(
    document: &str,
    identity: &AdapterIdentity,
    dialect: &Dialect,
) -> Result<ParseReport, AdapterError> {
    let trimmed = strip_bom(document);
    if trimmed.is_empty() {
        return Ok(ParseReport::from_outcomes(&identity.source_id, std::iter::empty()));
    }
    if !trimmed.starts_with('<') {
        return Err(AdapterError::Message(format!(
            "{}: feed body is not an XML document",
            identity.source_id
        )));
    }

    let outcomes = split_records(trimmed, dialect.record_tags)
        .into_iter()
        .map(|raw| {
            let outcome = XmlNode::parse_fragment(raw.fragment)
                .map_err(|err| SkipReason::Malformed(err.to_string()))
                .and_then(|node| normalize_record(&RecordView::new(&node), identity, dialect));
            (raw.index, RecordOutcome::from(outcome))
        });
    Ok(ParseReport::from_outcomes(&identity.source_id, outcomes))
}

pub fn parse_json_document(
    document: &str,
    identity: &AdapterIdentity,
    dialect: &Dialect,
) -> Result<ParseReport, AdapterError> {
    let trimmed = strip_bom(document);
    if trimmed.is_empty() {
        return Ok(ParseReport::from_outcomes(&identity.source_id, std::iter::empty()));
    }
    let value: JsonValue = serde_json::from_str(trimmed).map_err(|e| {
        AdapterError::Message(format!("{}: invalid JSON feed: {e}", identity.source_id))
    })?;

    let items: Vec<&JsonValue> = match &value {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => match ["properties", "listings", "items", "data"]
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
        {
            Some(items) => items.iter().collect(),
            None => vec![&value],
        },
        _ => {
            return Err(AdapterError::Message(format!(
                "{}: JSON feed is neither an array nor an object",
                identity.source_id
            )))
        }
    };

    let outcomes = items.into_iter().enumerate().map(|(index, item)| {
        let outcome = JsonRecord::new(item)
            .ok_or(SkipReason::NotAnObject)
            .and_then(|record| normalize_record(&record, identity, dialect));
        (index, RecordOutcome::from(outcome))
    });
    Ok(ParseReport::from_outcomes(&identity.source_id, outcomes))
}

#[derive(Debug, Clone)]
pub struct XmlFeedAdapter {
    identity: AdapterIdentity,
    format: FeedFormat,
    dialect: Dialect,
}

#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    identity: AdapterIdentity,
}

/// Sooprema endpoints answer with XML or JSON; the body decides.
#[derive(Debug, Clone)]
pub struct SoopremaAdapter {
    identity: AdapterIdentity,
}

#[async_trait]
impl FeedAdapter for XmlFeedAdapter {
    fn source_id(&self) -> &str {
        &self.identity.source_id
    }

    fn format(&self) -> FeedFormat {
        self.format
    }

    fn parse(&self, document: &str) -> Result<ParseReport, AdapterError> {
        parse_xml_document(document, &self.identity, &self.dialect)
    }
}

#[async_trait]
impl FeedAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.identity.source_id
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Json
    }

    fn parse(&self, document: &str) -> Result<ParseReport, AdapterError> {
        parse_json_document(document, &self.identity, &JSON_DIALECT)
    }
}

#[async_trait]
impl FeedAdapter for SoopremaAdapter {
    fn source_id(&self) -> &str {
        &self.identity.source_id
    }

    fn format(&self) -> FeedFormat {
        FeedFormat::Sooprema
    }

    fn parse(&self, document: &str) -> Result<ParseReport, AdapterError> {
        if sniff_json(document) {
            parse_json_document(document, &self.identity, &SOOPREMA_DIALECT)
        } else {
            parse_xml_document(document, &self.identity, &SOOPREMA_DIALECT)
        }
    }
}

pub fn kyero_adapter(source_id: &str, id_prefix: &str) -> XmlFeedAdapter {
    XmlFeedAdapter {
        identity: AdapterIdentity::new(source_id, id_prefix),
        format: FeedFormat::Kyero,
        dialect: KYERO_DIALECT,
    }
}

pub fn legacy_adapter(source_id: &str, id_prefix: &str) -> XmlFeedAdapter {
    XmlFeedAdapter {
        identity: AdapterIdentity::new(source_id, id_prefix),
        format: FeedFormat::Legacy,
        dialect: LEGACY_DIALECT,
    }
}

pub fn sooprema_adapter(source_id: &str, id_prefix: &str) -> SoopremaAdapter {
    SoopremaAdapter {
        identity: AdapterIdentity::new(source_id, id_prefix),
    }
}

pub fn json_adapter(source_id: &str, id_prefix: &str) -> JsonFeedAdapter {
    JsonFeedAdapter {
        identity: AdapterIdentity::new(source_id, id_prefix),
    }
}

pub fn adapter_for_format(
    format: FeedFormat,
    source_id: &str,
    id_prefix: &str,
) -> Box<dyn FeedAdapter> {
    match format {
        FeedFormat::Kyero => Box::new(kyero_adapter(source_id, id_prefix)),
        FeedFormat::Legacy => Box::new(legacy_adapter(source_id, id_prefix)),
        FeedFormat::Sooprema => Box::new(sooprema_adapter(source_id, id_prefix)),
        FeedFormat::Json => Box::new(json_adapter(source_id, id_prefix)),
    }
}

/// A captured feed body plus where it came from, for offline runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub format: FeedFormat,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_artifact: FixtureRawArtifact,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRawArtifact {
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

impl FixtureBundle {
    pub fn document(&self) -> Result<&str, AdapterError> {
        self.raw_artifact.inline_text.as_deref().ok_or_else(|| {
            AdapterError::Message(format!(
                "fixture {} has no raw artifact text",
                self.fixture_id
            ))
        })
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_inline_raw_artifact(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_raw_artifact(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    if bundle.raw_artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture raw artifact {}", raw_path.display()))?;
    bundle.raw_artifact.inline_text = Some(raw);
    Ok(())
}

/// Parses a fixture with the adapter registered for its source.
pub fn parse_fixture(
    adapter: &dyn FeedAdapter,
    bundle: &FixtureBundle,
) -> Result<ParseReport, AdapterError> {
    if bundle.source_id != adapter.source_id() {
        return Err(AdapterError::Message(format!(
            "bundle source_id={} does not match adapter source_id={}",
            bundle.source_id,
            adapter.source_id()
        )));
    }
    adapter.parse(bundle.document()?)
}
