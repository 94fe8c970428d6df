//! Tag catalog (`rules/tags.yaml`) and the rules that attach tags to developments.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use cbf_core::{slugify, Development, ListingStatus};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::load_yaml;
use crate::grouping::contains_token_run;

const FIRST_TIME_BUYER_CEILING: f64 = 200_000.0;
const FAMILY_HOME_MIN_BEDROOMS: u32 = 3;
const DEFAULT_GOLF_HOLES: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagCategory {
    Location,
    Price,
    Property,
    Status,
    Lifestyle,
    Feature,
    Beach,
    Golf,
    Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    pub category: TagCategory,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeachDistance {
    Beachfront,
    Walking,
    ShortDrive,
}

impl BeachDistance {
    /// Sort rank, nearest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Beachfront => 0,
            Self::Walking => 1,
            Self::ShortDrive => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GolfDistance {
    OnCourse,
    Walking,
    ShortDrive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeachZone {
    pub beach: String,
    pub distance: BeachDistance,
    #[serde(default)]
    pub town: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GolfZone {
    pub course: String,
    pub distance: GolfDistance,
    pub holes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBracket {
    pub id: String,
    pub name: String,
    pub min: f64,
    /// Open-ended when absent.
    #[serde(default)]
    pub max: Option<f64>,
}

impl PriceBracket {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && self.max.map_or(true, |max| price < max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeachMatch {
    pub beach: String,
    pub distance: BeachDistance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GolfMatch {
    pub course: String,
    pub distance: GolfDistance,
    pub holes: u32,
}

/// A development with the tags its rules produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedDevelopment {
    #[serde(flatten)]
    pub development: Development,
    pub tag_ids: Vec<String>,
    pub beach: Option<BeachMatch>,
    pub golf: Option<GolfMatch>,
    pub price_bracket: Option<String>,
}

impl TaggedDevelopment {
    pub fn has_tag(&self, id: &str) -> bool {
        self.tag_ids.iter().any(|t| t == id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TagsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    beach_zones: IndexMap<String, BeachZone>,
    #[serde(default)]
    golf_zones: IndexMap<String, GolfZone>,
    #[serde(default)]
    price_brackets: Vec<PriceBracket>,
}

#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    tags: Vec<Tag>,
    beach_zones: IndexMap<String, BeachZone>,
    golf_zones: IndexMap<String, GolfZone>,
    price_brackets: Vec<PriceBracket>,
}

impl TagCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file: TagsFile = load_yaml(path)?;
        Self::from_file(file).with_context(|| format!("validating {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TagsFile = serde_yaml::from_str(text).context("parsing tag catalog")?;
        Self::from_file(file)
    }

    fn from_file(file: TagsFile) -> Result<Self> {
        let mut seen = HashSet::new();
        for tag in &file.tags {
            if !seen.insert(tag.id.as_str()) {
                bail!("duplicate tag id {}", tag.id);
            }
        }
        // Zone keys are matched on their slug form.
        Ok(Self {
            tags: file.tags,
            beach_zones: file.beach_zones.into_iter().map(|(k, v)| (slugify(&k), v)).collect(),
            golf_zones: file.golf_zones.into_iter().map(|(k, v)| (slugify(&k), v)).collect(),
            price_brackets: file.price_brackets,
        })
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn tag(&self, id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == id)
    }

    pub fn tags_in(&self, category: TagCategory) -> impl Iterator<Item = &Tag> {
        self.tags.iter().filter(move |t| t.category == category)
    }

    pub fn price_brackets(&self) -> &[PriceBracket] {
        &self.price_brackets
    }

    pub fn price_bracket_for(&self, price: f64) -> Option<&PriceBracket> {
        self.price_brackets.iter().find(|b| b.contains(price))
    }

    /// Zone exact, then town exact, then a token-level partial match of the town.
    pub fn beach_for(&self, zone: &str, town: &str) -> Option<BeachMatch> {
        let to_match = |z: &BeachZone| BeachMatch {
            beach: z.beach.clone(),
            distance: z.distance,
        };
        let zone = slugify(zone.trim());
        let town = slugify(town.trim());
        if let Some(z) = self.beach_zones.get(&zone) {
            return Some(to_match(z));
        }
        if town.is_empty() {
            return None;
        }
        if let Some(z) = self.beach_zones.get(&town) {
            return Some(to_match(z));
        }
        self.beach_zones
            .iter()
            .find(|(key, _)| contains_token_run(&town, key) || contains_token_run(key, &town))
            .map(|(_, z)| to_match(z))
    }

    /// Like [`Self::beach_for`], plus any zone whose name mentions golf counts
    /// as an on-course match.
    pub fn golf_for(&self, zone: &str, town: &str) -> Option<GolfMatch> {
        let to_match = |z: &GolfZone| GolfMatch {
            course: z.course.clone(),
            distance: z.distance,
            holes: z.holes,
        };
        let zone_slug = slugify(zone.trim());
        if let Some(z) = self.golf_zones.get(&zone_slug) {
            return Some(to_match(z));
        }
        if zone.to_lowercase().contains("golf") {
            return Some(GolfMatch {
                course: zone.trim().to_string(),
                distance: GolfDistance::OnCourse,
                holes: DEFAULT_GOLF_HOLES,
            });
        }
        let town = slugify(town.trim());
        if town.is_empty() {
            return None;
        }
        if let Some(z) = self.golf_zones.get(&town) {
            return Some(to_match(z));
        }
        self.golf_zones
            .iter()
            .find(|(key, _)| contains_token_run(&town, key) || contains_token_run(key, &town))
            .map(|(_, z)| to_match(z))
    }

    fn push_tag(&self, tags: &mut Vec<String>, id: &str) {
        if self.tag(id).is_some() && !tags.iter().any(|t| t == id) {
            tags.push(id.to_string());
        }
    }

    pub fn tag_development(&self, development: &Development) -> TaggedDevelopment {
        let mut tag_ids = Vec::new();

        let beach = self.beach_for(&development.zone, &development.town);
        if beach.is_some() {
            self.push_tag(&mut tag_ids, "beach-lover");
        }
        let golf = self.golf_for(&development.zone, &development.town);
        if golf.is_some() {
            self.push_tag(&mut tag_ids, "golf-enthusiast");
        }

        for ty in &development.property_types {
            self.push_tag(&mut tag_ids, ty.label());
        }

        if development.has_pool {
            self.push_tag(&mut tag_ids, "private-pool");
        }
        if development.has_sea_view {
            self.push_tag(&mut tag_ids, "sea-view");
        }
        if development.has_garden {
            self.push_tag(&mut tag_ids, "garden");
        }

        match development.headline_status() {
            ListingStatus::KeyReady => self.push_tag(&mut tag_ids, "key-ready"),
            ListingStatus::OffPlan => self.push_tag(&mut tag_ids, "off-plan"),
            _ => {}
        }

        if development.price_from.is_some_and(|p| p < FIRST_TIME_BUYER_CEILING) {
            self.push_tag(&mut tag_ids, "first-time-buyer");
        }
        if development.bedroom_range.max >= FAMILY_HOME_MIN_BEDROOMS {
            self.push_tag(&mut tag_ids, "family-home");
        }

        let region = slugify(development.region.trim());
        if let Some(tag) = self
            .tags_in(TagCategory::Region)
            .find(|t| !region.is_empty() && slugify(&t.name) == region)
        {
            let id = tag.id.clone();
            self.push_tag(&mut tag_ids, &id);
        }

        let price_bracket = development
            .price_from
            .and_then(|p| self.price_bracket_for(p))
            .map(|b| b.id.clone());

        TaggedDevelopment {
            development: development.clone(),
            tag_ids,
            beach,
            golf,
            price_bracket,
        }
    }
}
