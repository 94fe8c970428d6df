//! Read-only catalog snapshot and the queries the web layer serves.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use anyhow::bail;
use cbf_core::{slugify, Area, Builder, Listing, ListingStatus, Statistics};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::gazetteer::Gazetteer;
use crate::grouping::{
    assign_keys, build_area, build_builder, build_development, group_listings, matches_area_text,
    GroupingConfig,
};
use crate::tags::{TagCatalog, TaggedDevelopment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    #[default]
    Source,
    PriceAsc,
    PriceDesc,
    Name,
    BeachDistance,
    Relevance,
}

impl FromStr for SortKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "source" => Self::Source,
            "price-asc" => Self::PriceAsc,
            "price-desc" => Self::PriceDesc,
            "name" => Self::Name,
            "beach-distance" => Self::BeachDistance,
            "relevance" => Self::Relevance,
            other => bail!("unknown sort key {other:?}"),
        })
    }
}

/// Conjunctive filter; an empty field imposes no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagFilter {
    /// Any of these tags.
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub zones: Vec<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub property_types: Vec<String>,
    pub regions: Vec<String>,
    pub statuses: Vec<ListingStatus>,
    pub beach_only: bool,
    pub golf_only: bool,
    pub sort: SortKey,
    /// `None` or `0` returns everything.
    pub limit: Option<usize>,
}

impl TagFilter {
    pub fn matches(&self, dev: &TaggedDevelopment) -> bool {
        let d = &dev.development;
        if !self.tags.is_empty() && !self.tags.iter().any(|t| dev.has_tag(t)) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| dev.has_tag(t)) {
            return false;
        }
        if !self.zones.is_empty() {
            let zone = slugify(d.zone.trim());
            if zone.is_empty() || !self.zones.iter().any(|z| slugify(z.trim()) == zone) {
                return false;
            }
        }
        if self.price_min.is_some() || self.price_max.is_some() {
            let Some(price) = d.price_from else {
                return false;
            };
            if self.price_min.is_some_and(|min| price < min)
                || self.price_max.is_some_and(|max| price > max)
            {
                return false;
            }
        }
        if !self.property_types.is_empty()
            && !d.property_types.iter().any(|ty| {
                self.property_types
                    .iter()
                    .any(|wanted| wanted.trim().eq_ignore_ascii_case(ty.label()))
            })
        {
            return false;
        }
        if !self.regions.is_empty() {
            let region = slugify(d.region.trim());
            if !self.regions.iter().any(|r| slugify(r.trim()) == region) {
                return false;
            }
        }
        if !self.statuses.is_empty() && !d.statuses.iter().any(|s| self.statuses.contains(s)) {
            return false;
        }
        if self.beach_only && dev.beach.is_none() {
            return false;
        }
        if self.golf_only && dev.golf.is_none() {
            return false;
        }
        true
    }
}

fn cmp_optional_price(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if descending => b.total_cmp(&a),
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort; unpriced and non-beach developments go last.
fn sort_developments(items: &mut [&TaggedDevelopment], key: SortKey) {
    match key {
        SortKey::Source => {}
        SortKey::PriceAsc => items.sort_by(|a, b| {
            cmp_optional_price(a.development.price_from, b.development.price_from, false)
        }),
        SortKey::PriceDesc => items.sort_by(|a, b| {
            cmp_optional_price(a.development.price_from, b.development.price_from, true)
        }),
        SortKey::Name => items.sort_by_cached_key(|d| d.development.name.to_lowercase()),
        SortKey::BeachDistance => {
            items.sort_by_key(|d| d.beach.as_ref().map_or(u8::MAX, |b| b.distance.rank()))
        }
        SortKey::Relevance => items.sort_by(|a, b| b.tag_ids.len().cmp(&a.tag_ids.len())),
    }
}

/// Immutable snapshot of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    listings: Vec<Listing>,
    developments: Vec<TaggedDevelopment>,
    development_index: HashMap<String, usize>,
    units: HashMap<String, Vec<usize>>,
    builders: Vec<Builder>,
    builder_index: HashMap<String, usize>,
    areas: Vec<Area>,
    area_index: HashMap<String, usize>,
    ungrouped: usize,
    tag_catalog: TagCatalog,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(
        mut listings: Vec<Listing>,
        config: &GroupingConfig,
        gazetteer: &Gazetteer,
        tag_catalog: &TagCatalog,
    ) -> Self {
        assign_keys(&mut listings, config);
        let grouping = group_listings(&listings, config);

        let developments: Vec<TaggedDevelopment> = grouping
            .developments
            .iter()
            .map(|(slug, members)| tag_catalog.tag_development(&build_development(slug, members)))
            .collect();
        let builders: Vec<Builder> = grouping
            .builders
            .iter()
            .map(|(slug, members)| build_builder(slug, members, config))
            .collect();
        let areas: Vec<Area> = grouping
            .areas
            .iter()
            .map(|(slug, members)| build_area(slug, members, gazetteer.area(slug), config))
            .collect();
        let ungrouped = grouping.ungrouped.len();
        drop(grouping);

        let mut units: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, listing) in listings.iter().enumerate() {
            if !listing.development_key.is_empty() {
                units.entry(listing.development_key.clone()).or_default().push(idx);
            }
        }

        Self {
            development_index: index_by(&developments, |d| &d.development.slug),
            builder_index: index_by(&builders, |b| &b.slug),
            area_index: index_by(&areas, |a| &a.slug),
            listings,
            developments,
            units,
            builders,
            areas,
            ungrouped,
            tag_catalog: tag_catalog.clone(),
        }
    }

    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    /// Listings left out of development grouping.
    pub fn ungrouped_count(&self) -> usize {
        self.ungrouped
    }

    pub fn tag_catalog(&self) -> &TagCatalog {
        &self.tag_catalog
    }

    pub fn developments(&self) -> &[TaggedDevelopment] {
        &self.developments
    }

    pub fn development(&self, slug: &str) -> Option<&TaggedDevelopment> {
        self.development_index.get(slug).map(|&i| &self.developments[i])
    }

    pub fn builders(&self) -> &[Builder] {
        &self.builders
    }

    pub fn builder(&self, slug: &str) -> Option<&Builder> {
        self.builder_index.get(slug).map(|&i| &self.builders[i])
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn area(&self, slug: &str) -> Option<&Area> {
        self.area_index.get(slug).map(|&i| &self.areas[i])
    }

    pub fn developments_by_builder(&self, slug: &str) -> Option<Vec<&TaggedDevelopment>> {
        let builder = self.builder(slug)?;
        Some(
            builder
                .development_slugs
                .iter()
                .filter_map(|s| self.development(s))
                .collect(),
        )
    }

    /// Developments grouped under the area, plus unresolved developments whose
    /// town or zone text matches it.
    pub fn developments_in_area(&self, slug: &str) -> Option<Vec<&TaggedDevelopment>> {
        let area = self.area(slug)?;
        Some(
            self.developments
                .iter()
                .filter(|dev| {
                    let d = &dev.development;
                    match &d.area_slug {
                        Some(resolved) => {
                            resolved == slug || area.development_slugs.contains(&d.slug)
                        }
                        None => {
                            area.development_slugs.contains(&d.slug)
                                || matches_area_text(&area.name, &area.slug, &d.town, &d.zone)
                        }
                    }
                })
                .collect(),
        )
    }

    pub fn development_units(&self, slug: &str) -> Option<Vec<&Listing>> {
        self.development(slug)?;
        Some(
            self.units
                .get(slug)
                .map(|idxs| idxs.iter().map(|&i| &self.listings[i]).collect())
                .unwrap_or_default(),
        )
    }

    pub fn filter_by_tags(&self, filter: &TagFilter) -> Vec<&TaggedDevelopment> {
        let mut matched: Vec<&TaggedDevelopment> = self
            .developments
            .iter()
            .filter(|d| filter.matches(d))
            .collect();
        sort_developments(&mut matched, filter.sort);
        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            matched.truncate(limit);
        }
        matched
    }

    pub fn statistics(&self) -> Statistics {
        let prices: Vec<f64> = self
            .developments
            .iter()
            .flat_map(|d| [d.development.price_from, d.development.price_to])
            .flatten()
            .filter(|p| *p > 0.0)
            .collect();
        let count_status = |status: ListingStatus| {
            self.developments
                .iter()
                .filter(|d| d.development.headline_status() == status)
                .count()
        };
        Statistics {
            total_developments: self.developments.len(),
            total_properties: self.developments.iter().map(|d| d.development.total_units).sum(),
            total_areas: self.areas.len(),
            total_builders: self.builders.len(),
            price_from: prices.iter().copied().reduce(f64::min).unwrap_or(0.0),
            price_to: prices.iter().copied().reduce(f64::max).unwrap_or(0.0),
            average_price: if prices.is_empty() {
                0.0
            } else {
                (prices.iter().sum::<f64>() / prices.len() as f64).round()
            },
            key_ready_count: count_status(ListingStatus::KeyReady),
            under_construction_count: count_status(ListingStatus::UnderConstruction),
            off_plan_count: count_status(ListingStatus::OffPlan),
        }
    }

    /// Development count per catalog tag, in catalog order, zeros included.
    pub fn tag_statistics(&self) -> IndexMap<String, usize> {
        let mut stats: IndexMap<String, usize> =
            self.tag_catalog.tags().iter().map(|t| (t.id.clone(), 0)).collect();
        for dev in &self.developments {
            for id in &dev.tag_ids {
                if let Some(count) = stats.get_mut(id) {
                    *count += 1;
                }
            }
        }
        stats
    }

    pub fn beach_groups(&self) -> IndexMap<&str, Vec<&TaggedDevelopment>> {
        let mut groups: IndexMap<&str, Vec<&TaggedDevelopment>> = IndexMap::new();
        for dev in &self.developments {
            if let Some(beach) = &dev.beach {
                groups.entry(beach.beach.as_str()).or_default().push(dev);
            }
        }
        groups
    }

    pub fn golf_groups(&self) -> IndexMap<&str, Vec<&TaggedDevelopment>> {
        let mut groups: IndexMap<&str, Vec<&TaggedDevelopment>> = IndexMap::new();
        for dev in &self.developments {
            if let Some(golf) = &dev.golf {
                groups.entry(golf.course.as_str()).or_default().push(dev);
            }
        }
        groups
    }

    /// Every bracket is present, empty ones included.
    pub fn price_bracket_groups(&self) -> IndexMap<&str, Vec<&TaggedDevelopment>> {
        let mut groups: IndexMap<&str, Vec<&TaggedDevelopment>> = self
            .tag_catalog
            .price_brackets()
            .iter()
            .map(|b| (b.id.as_str(), Vec::new()))
            .collect();
        for dev in &self.developments {
            if let Some(id) = dev.price_bracket.as_deref() {
                if let Some(group) = groups.get_mut(id) {
                    group.push(dev);
                }
            }
        }
        groups
    }
}

fn index_by<T>(items: &[T], key: impl Fn(&T) -> &String) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        index.entry(key(item).clone()).or_insert(i);
    }
    index
}
