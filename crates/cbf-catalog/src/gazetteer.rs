//! Canonical areas and the lookups that resolve free-text listing locations to them.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use cbf_core::{slugify, Listing};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::debug;

use crate::config::load_yaml;

pub const FUZZY_THRESHOLD: f64 = 0.94;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEntry {
    pub slug: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Urbanisations and zones that belong to this area.
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AreasFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    areas: Vec<AreaEntry>,
    /// Province fragment to region, for towns outside the gazetteer.
    #[serde(default)]
    province_regions: Vec<ProvinceRegion>,
    #[serde(default)]
    default_region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProvinceRegion {
    province: String,
    region: String,
}

/// How a location was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Zone,
    Name,
    Fuzzy,
}

/// Area table built once per run. Zone and name lookups are slug-keyed maps.
#[derive(Debug, Clone, Default)]
pub struct Gazetteer {
    areas: Vec<AreaEntry>,
    by_slug: HashMap<String, usize>,
    by_zone: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    province_regions: Vec<(String, String)>,
    default_region: String,
}

impl Gazetteer {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file: AreasFile = load_yaml(path)?;
        Ok(Self::from_parts(
            file.areas,
            file.province_regions
                .into_iter()
                .map(|p| (p.province, p.region))
                .collect(),
            file.default_region,
        ))
    }

    pub fn new(areas: Vec<AreaEntry>) -> Self {
        Self::from_parts(areas, vec![("murcia".to_string(), "Costa Calida".to_string())], None)
    }

    fn from_parts(
        areas: Vec<AreaEntry>,
        province_regions: Vec<(String, String)>,
        default_region: Option<String>,
    ) -> Self {
        let mut by_slug = HashMap::new();
        let mut by_zone = HashMap::new();
        let mut by_name = HashMap::new();
        for (idx, area) in areas.iter().enumerate() {
            by_slug.entry(area.slug.clone()).or_insert(idx);
            for zone in &area.zones {
                by_zone.entry(slugify(zone)).or_insert(idx);
            }
            for name in std::iter::once(&area.name).chain(&area.aliases) {
                by_name.entry(slugify(name)).or_insert(idx);
            }
        }
        Self {
            areas,
            by_slug,
            by_zone,
            by_name,
            province_regions: province_regions
                .into_iter()
                .map(|(p, r)| (slugify(&p), r))
                .collect(),
            default_region: default_region.unwrap_or_else(|| "Costa Blanca South".to_string()),
        }
    }

    pub fn areas(&self) -> &[AreaEntry] {
        &self.areas
    }

    pub fn area(&self, slug: &str) -> Option<&AreaEntry> {
        self.by_slug.get(slug).map(|&i| &self.areas[i])
    }

    /// Zone table first, then names and aliases, then a Jaro-Winkler match
    /// over names for misspelt towns.
    pub fn resolve(
        &self,
        town: &str,
        zone: &str,
        location_detail: &str,
    ) -> Option<(&AreaEntry, MatchKind)> {
        let zone_slug = slugify(zone.trim());
        if let Some(&idx) = self.by_zone.get(&zone_slug) {
            return Some((&self.areas[idx], MatchKind::Zone));
        }

        let candidates = [slugify(town.trim()), slugify(location_detail.trim()), zone_slug];
        for slug in candidates.iter().filter(|s| !s.is_empty()) {
            if let Some(&idx) = self.by_name.get(slug) {
                return Some((&self.areas[idx], MatchKind::Name));
            }
        }

        let town_slug = &candidates[0];
        if town_slug.is_empty() {
            return None;
        }
        self.by_name
            .iter()
            .map(|(name, &idx)| (jaro_winkler(town_slug, name), idx))
            .filter(|(score, _)| *score >= FUZZY_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, idx)| (&self.areas[idx], MatchKind::Fuzzy))
    }

    /// Region for a location the gazetteer could not place.
    pub fn fallback_region(&self, province: &str) -> &str {
        let province = slugify(province);
        self.province_regions
            .iter()
            .find(|(fragment, _)| !province.is_empty() && province.contains(fragment.as_str()))
            .map(|(_, region)| region.as_str())
            .unwrap_or(&self.default_region)
    }

    /// Sets `area_slug` and fills an empty `region`.
    pub fn apply(&self, listing: &mut Listing) {
        match self.resolve(&listing.town, &listing.zone, &listing.location_detail) {
            Some((area, kind)) => {
                debug!(id = %listing.id, area = %area.slug, ?kind, "location resolved");
                listing.area_slug = Some(area.slug.clone());
                if listing.region.trim().is_empty() {
                    listing.region = area.region.clone();
                }
            }
            None => {
                listing.area_slug = None;
                if listing.region.trim().is_empty() {
                    listing.region = self.fallback_region(&listing.province).to_string();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(slug: &str, name: &str, region: &str, aliases: &[&str], zones: &[&str]) -> AreaEntry {
        AreaEntry {
            slug: slug.to_string(),
            name: name.to_string(),
            region: region.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            zones: zones.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn gazetteer() -> Gazetteer {
        Gazetteer::new(vec![
            area(
                "torrevieja",
                "Torrevieja",
                "Costa Blanca South",
                &[],
                &["Aguas Nuevas", "La Mata"],
            ),
            area("javea", "Jávea", "Costa Blanca North", &["Xàbia", "Javea"], &["Montgó"]),
            area("los-alcazares", "Los Alcázares", "Costa Calida", &[], &["Los Narejos"]),
        ])
    }

    #[test]
    fn zone_table_wins_over_town() {
        let g = gazetteer();
        let (area, kind) = g.resolve("Orihuela", "aguas nuevas", "").unwrap();
        assert_eq!(area.slug, "torrevieja");
        assert_eq!(kind, MatchKind::Zone);
    }

    #[test]
    fn names_and_aliases_ignore_case_and_accents() {
        let g = gazetteer();
        assert_eq!(g.resolve("TORREVIEJA ", "", "").unwrap().0.slug, "torrevieja");
        assert_eq!(g.resolve("Xabia", "", "").unwrap().0.slug, "javea");
        assert_eq!(g.resolve("", "", "Los Alcazares").unwrap().0.slug, "los-alcazares");
    }

    #[test]
    fn misspelt_town_resolves_fuzzily() {
        let g = gazetteer();
        let (area, kind) = g.resolve("Torreveija", "", "").unwrap();
        assert_eq!(area.slug, "torrevieja");
        assert_eq!(kind, MatchKind::Fuzzy);
        assert!(g.resolve("Benidorm", "", "").is_none());
        assert!(g.resolve("", "", "").is_none());
    }

    #[test]
    fn apply_sets_area_and_region_with_province_fallback() {
        let g = gazetteer();
        let mut listing = Listing::new("redsp", "redsp-", "A1");
        listing.town = "Torrevieja".into();
        g.apply(&mut listing);
        assert_eq!(listing.area_slug.as_deref(), Some("torrevieja"));
        assert_eq!(listing.region, "Costa Blanca South");

        let mut murcia = Listing::new("redsp", "redsp-", "A2");
        murcia.town = "Sucina".into();
        murcia.province = "Región de Murcia".into();
        g.apply(&mut murcia);
        assert_eq!(murcia.area_slug, None);
        assert_eq!(murcia.region, "Costa Calida");

        let mut tagged = Listing::new("redsp", "redsp-", "A3");
        tagged.town = "Jávea".into();
        tagged.region = "Costa Blanca North".into();
        g.apply(&mut tagged);
        assert_eq!(tagged.region, "Costa Blanca North");
    }
}
