//! One pipeline run: feed registry → fetch or fixture → parse → merge → hooks → catalog.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use cbf_adapters::{
    adapter_for_format, load_fixture_bundle, parse_fixture, AdapterContext, ParseReport,
};
use cbf_core::{format_price_eur, Listing};
use cbf_fetch::{sha256_hex, FeedFetcher, FeedRequest};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{FeedOrigin, FeedRegistry, FeedSource, PipelineConfig};
use crate::gazetteer::Gazetteer;
use crate::mapping::DevelopmentMapping;
use crate::query::Catalog;
use crate::tags::TagCatalog;

#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
}

/// Normalisation-time enrichment applied to the merged listings, in order.
pub trait ListingHook: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, listings: &mut [Listing], ctx: &HookContext) -> Result<()>;
}

impl ListingHook for DevelopmentMapping {
    fn name(&self) -> &str {
        "development-mapping"
    }

    fn apply(&self, listings: &mut [Listing], ctx: &HookContext) -> Result<()> {
        for listing in listings {
            DevelopmentMapping::apply(self, listing, ctx.today);
        }
        Ok(())
    }
}

impl ListingHook for Gazetteer {
    fn name(&self) -> &str {
        "gazetteer"
    }

    fn apply(&self, listings: &mut [Listing], _ctx: &HookContext) -> Result<()> {
        for listing in listings {
            Gazetteer::apply(self, listing);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub source_id: String,
    pub display_name: String,
    pub origin: String,
    pub status: FeedStatus,
    pub records_seen: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub dropped_resale: usize,
    pub content_hash: Option<String>,
    pub error: Option<String>,
}

impl FeedReport {
    fn failed(feed: &FeedSource, error: &anyhow::Error) -> Self {
        Self {
            source_id: feed.source_id.clone(),
            display_name: feed.display_name.clone(),
            origin: origin_label(feed),
            status: FeedStatus::Failed,
            records_seen: 0,
            parsed: 0,
            skipped: 0,
            dropped_resale: 0,
            content_hash: None,
            error: Some(format!("{error:#}")),
        }
    }
}

fn origin_label(feed: &FeedSource) -> String {
    match feed.origin() {
        Ok(FeedOrigin::Url(url)) => url.to_string(),
        Ok(FeedOrigin::Fixture(path)) => path.display().to_string(),
        Err(_) => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
    /// Listings dropped because a feed of equal or higher priority carried the same reference.
    pub merged_duplicates: usize,
    pub catalog: Catalog,
}

impl PipelineRun {
    pub fn failed_feeds(&self) -> usize {
        self.feeds.iter().filter(|f| f.status == FeedStatus::Failed).count()
    }
}

struct IngestedFeed {
    report: ParseReport,
    content_hash: Option<String>,
    dropped_resale: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    http: FeedFetcher,
    mapping: DevelopmentMapping,
    gazetteer: Gazetteer,
    tags: TagCatalog,
    extra_hooks: Vec<Box<dyn ListingHook>>,
}

impl Pipeline {
    /// Builds the HTTP clients and loads the rule files under `rules/`.
    /// `developments.yaml` is optional.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = FeedFetcher::new(config.fetcher_config())?;
        let rules = config.rules_dir();
        let gazetteer = Gazetteer::load(rules.join("areas.yaml"))?;
        let tags = TagCatalog::load(rules.join("tags.yaml"))?;
        let mapping_path = rules.join("developments.yaml");
        let mapping = if mapping_path.exists() {
            DevelopmentMapping::load(&mapping_path)?
        } else {
            DevelopmentMapping::default()
        };
        info!(
            areas = gazetteer.areas().len(),
            tags = tags.tags().len(),
            mapped_references = mapping.len(),
            "rules loaded"
        );
        Ok(Self {
            config,
            http,
            mapping,
            gazetteer,
            tags,
            extra_hooks: Vec::new(),
        })
    }

    /// Hooks run after the mapping file and the gazetteer.
    pub fn with_hooks(mut self, hooks: Vec<Box<dyn ListingHook>>) -> Self {
        self.extra_hooks = hooks;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<PipelineRun> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let started_at = Utc::now();
        let registry = self.load_registry().await?;
        let ctx = AdapterContext::new(run_id);

        let mut feeds = Vec::new();
        let mut batches = Vec::new();
        let mut last_error = None;
        let mut enabled = 0usize;

        for feed in registry.enabled() {
            enabled += 1;
            match self.ingest_feed(feed, &ctx).await {
                Ok(ingested) => {
                    info!(
                        source_id = %feed.source_id,
                        parsed = ingested.report.listings.len(),
                        skipped = ingested.report.skipped.len(),
                        dropped_resale = ingested.dropped_resale,
                        "feed ingested"
                    );
                    feeds.push(FeedReport {
                        source_id: feed.source_id.clone(),
                        display_name: feed.display_name.clone(),
                        origin: origin_label(feed),
                        status: FeedStatus::Ok,
                        records_seen: ingested.report.records_seen(),
                        parsed: ingested.report.listings.len(),
                        skipped: ingested.report.skipped.len(),
                        dropped_resale: ingested.dropped_resale,
                        content_hash: ingested.content_hash,
                        error: None,
                    });
                    batches.push((feed.priority, ingested.report.listings));
                }
                Err(err) => {
                    warn!(
                        source_id = %feed.source_id,
                        error = %format!("{err:#}"),
                        "feed failed; skipping"
                    );
                    feeds.push(FeedReport::failed(feed, &err));
                    last_error = Some(err);
                }
            }
        }

        if enabled > 0 && batches.is_empty() {
            let err = last_error.unwrap_or_else(|| anyhow!("no feed produced listings"));
            return Err(err.context(format!("all {enabled} enabled feeds failed")));
        }

        let (mut listings, merged_duplicates) = merge_feeds(batches);
        let hook_ctx = HookContext {
            run_id,
            today: started_at.date_naive(),
        };
        let mut hooks: Vec<&dyn ListingHook> = vec![&self.mapping, &self.gazetteer];
        for hook in &self.extra_hooks {
            hooks.push(hook.as_ref());
        }
        for hook in hooks {
            hook.apply(&mut listings, &hook_ctx)
                .with_context(|| format!("running hook {}", hook.name()))?;
        }

        let catalog = Catalog::build(
            listings,
            &self.config.grouping_config(),
            &self.gazetteer,
            &self.tags,
        );
        info!(
            listings = catalog.listings().len(),
            merged_duplicates,
            developments = catalog.developments().len(),
            builders = catalog.builders().len(),
            areas = catalog.areas().len(),
            "catalog built"
        );

        Ok(PipelineRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds,
            merged_duplicates,
            catalog,
        })
    }

    async fn load_registry(&self) -> Result<FeedRegistry> {
        let path = self.config.feeds_path();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        FeedRegistry::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn fixture_path(&self, path: &std::path::Path) -> PathBuf {
        self.config.workspace_root.join(path)
    }

    async fn ingest_feed(&self, feed: &FeedSource, ctx: &AdapterContext) -> Result<IngestedFeed> {
        let adapter = adapter_for_format(feed.format, &feed.source_id, &feed.id_prefix());
        let (mut report, content_hash) = match feed.origin()? {
            FeedOrigin::Url(url) => {
                let request = FeedRequest::new(&feed.source_id, url)
                    .lenient_tls(feed.accept_invalid_certs);
                let fetched = adapter
                    .fetch(&self.http, ctx, &request)
                    .await
                    .with_context(|| format!("fetching {}", feed.source_id))?;
                let report = adapter
                    .parse(&fetched.text())
                    .with_context(|| format!("parsing {}", feed.source_id))?;
                (report, Some(fetched.content_hash))
            }
            FeedOrigin::Fixture(path) => {
                let bundle = load_fixture_bundle(self.fixture_path(path))?;
                let report = parse_fixture(adapter.as_ref(), &bundle)
                    .with_context(|| format!("parsing fixture for {}", feed.source_id))?;
                let hash = bundle.document().ok().map(|doc| sha256_hex(doc.as_bytes()));
                (report, hash)
            }
        };
        let dropped_resale = if feed.new_builds_only {
            report.retain_new_builds()
        } else {
            0
        };
        Ok(IngestedFeed {
            report,
            content_hash,
            dropped_resale,
        })
    }
}

/// Merges per-feed listings by upper-cased reference. Order is first-seen; a
/// strictly higher priority replaces the earlier listing in place.
pub fn merge_feeds(batches: Vec<(i32, Vec<Listing>)>) -> (Vec<Listing>, usize) {
    let mut merged: Vec<Listing> = Vec::new();
    let mut priorities: Vec<i32> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut duplicates = 0usize;

    for (priority, listings) in batches {
        for listing in listings {
            let key = listing.reference.trim().to_uppercase();
            match seen.get(&key) {
                Some(&idx) => {
                    duplicates += 1;
                    if priority > priorities[idx] {
                        merged[idx] = listing;
                        priorities[idx] = priority;
                    }
                }
                None => {
                    seen.insert(key, merged.len());
                    merged.push(listing);
                    priorities.push(priority);
                }
            }
        }
    }
    (merged, duplicates)
}

pub async fn run_pipeline_from_env() -> Result<PipelineRun> {
    let pipeline = Pipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once().await
}

/// Markdown brief for one run.
pub fn render_summary(run: &PipelineRun) -> String {
    let stats = run.catalog.statistics();
    let price_range = if stats.price_from > 0.0 {
        format!(
            "{} - {}",
            format_price_eur(stats.price_from),
            format_price_eur(stats.price_to)
        )
    } else {
        "Contact for pricing".to_string()
    };

    let mut lines = vec![
        "# CBF Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!(
            "- Feeds: {} ok, {} failed",
            run.feeds.len() - run.failed_feeds(),
            run.failed_feeds()
        ),
        format!("- Developments: {}", stats.total_developments),
        format!("- Properties: {}", stats.total_properties),
        format!("- Builders: {}", stats.total_builders),
        format!("- Areas: {}", stats.total_areas),
        format!("- Price range: {price_range}"),
        format!(
            "- Status: {} key-ready, {} under construction, {} off-plan",
            stats.key_ready_count, stats.under_construction_count, stats.off_plan_count
        ),
    ];
    if run.merged_duplicates > 0 {
        lines.push(format!("- Duplicate references merged: {}", run.merged_duplicates));
    }
    if run.catalog.ungrouped_count() > 0 {
        lines.push(format!("- Ungrouped listings: {}", run.catalog.ungrouped_count()));
    }

    lines.push(String::new());
    lines.push("## Feeds".to_string());
    for feed in &run.feeds {
        match feed.status {
            FeedStatus::Ok => lines.push(format!(
                "- {}: {} parsed, {} skipped, {} resale dropped",
                feed.source_id, feed.parsed, feed.skipped, feed.dropped_resale
            )),
            FeedStatus::Failed => lines.push(format!(
                "- {}: failed ({})",
                feed.source_id,
                feed.error.as_deref().unwrap_or("unknown error")
            )),
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn listing(source: &str, reference: &str, price: f64) -> Listing {
        let mut l = Listing::new(source, &format!("{source}-"), reference);
        l.price = price;
        l
    }

    /// Temp workspace with the real rule files and the given feed registry.
    fn temp_workspace(feeds_yaml: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir_all(&rules).unwrap();
        for file in ["areas.yaml", "tags.yaml", "developments.yaml"] {
            std::fs::copy(workspace_root().join("rules").join(file), rules.join(file)).unwrap();
        }
        std::fs::write(dir.path().join("feeds.yaml"), feeds_yaml).unwrap();
        dir
    }

    fn fixture(source_id: &str) -> String {
        workspace_root()
            .join("fixtures")
            .join(source_id)
            .join("sample")
            .join("bundle.json")
            .display()
            .to_string()
    }

    fn pipeline_for(dir: &tempfile::TempDir) -> Pipeline {
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        Pipeline::new(config).unwrap()
    }

    #[test]
    fn merge_prefers_higher_priority_and_keeps_first_seen_order() {
        let (merged, duplicates) = merge_feeds(vec![
            (0, vec![listing("a", "N1", 100.0), listing("a", "n2", 200.0)]),
            (10, vec![listing("b", "N2", 250.0), listing("b", "N3", 300.0)]),
            (10, vec![listing("c", "n3 ", 999.0)]),
        ]);
        assert_eq!(duplicates, 2);
        let ids: Vec<&str> = merged.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["a-N1", "b-N2", "b-N3"]);
        assert_eq!(merged[1].price, 250.0);
    }

    #[tokio::test]
    async fn run_once_builds_catalog_from_fixture_feeds() {
        let feeds = format!(
            r#"
feeds:
  - {{ source_id: redsp, display_name: REDSP, format: kyero, fixture: "{}", priority: 10, new_builds_only: true }}
  - {{ source_id: legacy, display_name: Legacy, format: legacy, fixture: "{}", id_prefix: "lg-" }}
  - {{ source_id: background, display_name: Background, format: sooprema, fixture: "{}", id_prefix: "bp-" }}
  - {{ source_id: partner-json, display_name: Partner, format: json, fixture: "{}", id_prefix: "pj-" }}
  - {{ source_id: broken, display_name: Broken, format: kyero, fixture: "missing/bundle.json" }}
  - {{ source_id: paused, display_name: Paused, format: kyero, fixture: "missing/bundle.json", enabled: false }}
"#,
            fixture("redsp"),
            fixture("legacy"),
            fixture("background"),
            fixture("partner-json"),
        );
        let dir = temp_workspace(&feeds);
        let run = pipeline_for(&dir).run_once().await.unwrap();

        assert_eq!(run.feeds.len(), 5);
        assert_eq!(run.failed_feeds(), 1);
        let redsp = &run.feeds[0];
        assert_eq!(redsp.status, FeedStatus::Ok);
        assert_eq!((redsp.parsed, redsp.skipped, redsp.dropped_resale), (3, 1, 1));
        assert!(redsp.content_hash.as_deref().is_some_and(|h| h.len() == 64));
        assert!(run.feeds[4].error.as_deref().unwrap_or_default().contains("missing"));

        let catalog = &run.catalog;
        let gomera = catalog.development("gomera-star").unwrap();
        assert_eq!(gomera.development.total_units, 2);
        assert_eq!(gomera.development.area_slug.as_deref(), Some("torrevieja"));

        let mapped = catalog.development("la-mata-beach-residences").unwrap();
        assert_eq!(mapped.development.unit_references, vec!["N7531", "N7532"]);
        assert!(mapped.has_tag("beach-lover"));

        assert!(catalog.listings().iter().all(|l| !l.region.is_empty()));
        assert!(catalog.listings().iter().all(|l| !l.development_key.is_empty()));
        assert!(catalog.area("torrevieja").is_some());

        let brief = render_summary(&run);
        assert!(brief.contains("# CBF Sync Brief"));
        assert!(brief.contains("- broken: failed"));
        assert!(brief.contains("- redsp: 3 parsed, 1 skipped, 1 resale dropped"));
    }

    #[tokio::test]
    async fn higher_priority_feed_wins_duplicate_references() {
        let mirror = serde_json::json!({
            "fixture_id": "mirror-sample",
            "source_id": "mirror",
            "format": "kyero",
            "captured_from_url": "https://mirror.example.com/kyero.xml",
            "fetched_at": "2026-03-02T06:00:00Z",
            "raw_artifact": {
                "content_type": "application/xml",
                "path": null,
                "inline_text": "<root><property><ref>N7531</ref><price>199000</price><new_build>1</new_build><type>Apartment</type><town>Torrevieja</town></property></root>"
            },
            "notes": null
        });
        let feeds = format!(
            r#"
feeds:
  - {{ source_id: redsp, display_name: REDSP, format: kyero, fixture: "{}", priority: 10 }}
  - {{ source_id: mirror, display_name: Mirror, format: kyero, fixture: mirror.json, priority: 20 }}
"#,
            fixture("redsp"),
        );
        let dir = temp_workspace(&feeds);
        std::fs::write(dir.path().join("mirror.json"), mirror.to_string()).unwrap();

        let run = pipeline_for(&dir).run_once().await.unwrap();
        assert_eq!(run.merged_duplicates, 1);
        let unit = run
            .catalog
            .listings()
            .iter()
            .find(|l| l.reference == "N7531")
            .unwrap();
        assert_eq!(unit.source_id, "mirror");
        assert_eq!(unit.price, 199_000.0);
        assert_eq!(run.catalog.listings()[0].reference, "N7531");
    }

    #[tokio::test]
    async fn run_fails_when_every_enabled_feed_fails() {
        let dir = temp_workspace(
            "feeds:\n  - { source_id: a, display_name: A, format: kyero, fixture: nope/a.json }\n  - { source_id: b, display_name: B, format: json, fixture: nope/b.json }\n",
        );
        let err = pipeline_for(&dir).run_once().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("all 2 enabled feeds failed"));
        assert!(message.contains("nope/b.json"));
    }

    #[tokio::test]
    async fn empty_registry_yields_empty_catalog() {
        let dir = temp_workspace("feeds: []\n");
        let run = pipeline_for(&dir).run_once().await.unwrap();
        assert!(run.feeds.is_empty());
        assert_eq!(run.catalog.statistics().total_developments, 0);
        assert!(render_summary(&run).contains("Contact for pricing"));
    }
}
