//! Catalog pipeline: feed registry, enrichment rules, grouping, tagging and queries.

pub mod config;
pub mod gazetteer;
pub mod grouping;
pub mod mapping;
pub mod pipeline;
pub mod query;
pub mod tags;

pub use config::{FeedOrigin, FeedRegistry, FeedSource, PipelineConfig};
pub use gazetteer::{AreaEntry, Gazetteer, MatchKind};
pub use grouping::{DevelopmentKeyPolicy, GroupingConfig};
pub use mapping::{DevelopmentMapping, MappedDevelopment};
pub use pipeline::{
    merge_feeds, render_summary, run_pipeline_from_env, FeedReport, FeedStatus, HookContext,
    ListingHook, Pipeline, PipelineRun,
};
pub use query::{Catalog, SortKey, TagFilter};
pub use tags::{
    BeachMatch, GolfMatch, PriceBracket, Tag, TagCatalog, TagCategory, TaggedDevelopment,
};

pub const CRATE_NAME: &str = "cbf-catalog";
