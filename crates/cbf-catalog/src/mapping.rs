//! Reference-to-development mapping file (`rules/developments.yaml`).

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use cbf_core::{parse_delivery_date, Listing, ListingStatus};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::load_yaml;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappedDevelopment {
    pub development: String,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub delivery_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MappingFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    references: HashMap<String, MappedDevelopment>,
}

/// Fills development details that a feed leaves out, keyed by upper-cased reference.
#[derive(Debug, Clone, Default)]
pub struct DevelopmentMapping {
    entries: HashMap<String, MappedDevelopment>,
}

impl DevelopmentMapping {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file: MappingFile = load_yaml(path)?;
        Ok(Self::new(file.references))
    }

    pub fn new(entries: HashMap<String, MappedDevelopment>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(reference, entry)| (reference.trim().to_uppercase(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, reference: &str) -> Option<&MappedDevelopment> {
        self.entries.get(&reference.trim().to_uppercase())
    }

    /// Feed values always win; the mapping only fills gaps. A unit without a
    /// vendor status gets one derived from its delivery date relative to `today`.
    pub fn apply(&self, listing: &mut Listing, today: NaiveDate) {
        if let Some(entry) = self.get(&listing.reference) {
            if listing.development_name.is_none() {
                listing.development_name = Some(entry.development.clone());
            }
            if listing.developer_name.is_none() {
                listing.developer_name = entry.developer.clone();
            }
            if listing.zone.trim().is_empty() {
                if let Some(zone) = &entry.zone {
                    listing.zone = zone.clone();
                }
            }
            if listing.completion_date.is_none() {
                listing.completion_date = entry.delivery_date.clone();
            }
        }

        if listing.status.is_none() {
            listing.status = listing
                .completion_date
                .as_deref()
                .and_then(parse_delivery_date)
                .map(|date| ListingStatus::from_delivery_date(date, today));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> DevelopmentMapping {
        DevelopmentMapping::new(HashMap::from([(
            "n7531".to_string(),
            MappedDevelopment {
                development: "La Mata Beach Residences".to_string(),
                developer: Some("Grupo Mediterraneo".to_string()),
                zone: Some("La Mata".to_string()),
                delivery_date: Some("2026-06-01".to_string()),
            },
        )]))
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn fills_missing_fields_by_reference_case_insensitively() {
        let mut listing = Listing::new("redsp", "redsp-", "N7531");
        mapping().apply(&mut listing, today());

        assert_eq!(listing.development_name.as_deref(), Some("La Mata Beach Residences"));
        assert_eq!(listing.developer_name.as_deref(), Some("Grupo Mediterraneo"));
        assert_eq!(listing.zone, "La Mata");
        assert_eq!(listing.completion_date.as_deref(), Some("2026-06-01"));
        assert_eq!(listing.status, Some(ListingStatus::UnderConstruction));
    }

    #[test]
    fn feed_values_are_never_overridden() {
        let mut listing = Listing::new("redsp", "redsp-", "N7531");
        listing.development_name = Some("Feed Name".into());
        listing.zone = "Feed Zone".into();
        listing.status = Some(ListingStatus::KeyReady);
        mapping().apply(&mut listing, today());

        assert_eq!(listing.development_name.as_deref(), Some("Feed Name"));
        assert_eq!(listing.zone, "Feed Zone");
        assert_eq!(listing.status, Some(ListingStatus::KeyReady));
    }

    #[test]
    fn status_is_derived_from_delivery_date_for_unmapped_units() {
        let mut soon = Listing::new("legacy", "lg-", "X1");
        soon.completion_date = Some("15/03/2026".into());
        let mut far = Listing::new("legacy", "lg-", "X2");
        far.completion_date = Some("2028-12-31".into());
        let mut unknown = Listing::new("legacy", "lg-", "X3");
        unknown.completion_date = Some("next spring".into());

        let m = DevelopmentMapping::default();
        for l in [&mut soon, &mut far, &mut unknown] {
            m.apply(l, today());
        }
        assert_eq!(soon.status, Some(ListingStatus::KeyReady));
        assert_eq!(far.status, Some(ListingStatus::OffPlan));
        assert_eq!(unknown.status, None);
    }
}
