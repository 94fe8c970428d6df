//! Read-only JSON API over the latest catalog snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cbf_catalog::{Catalog, Pipeline, PipelineConfig, SortKey, TagFilter, TaggedDevelopment};
use cbf_core::{Area, Builder, ListingStatus, Statistics};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cbf-web";

/// Produces a fresh catalog on demand.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn build(&self) -> Result<Catalog>;
}

pub struct PipelineSource {
    pipeline: Pipeline,
}

impl PipelineSource {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl CatalogSource for PipelineSource {
    async fn build(&self) -> Result<Catalog> {
        let run = self.pipeline.run_once().await?;
        Ok(run.catalog)
    }
}

struct Snapshot {
    catalog: Arc<Catalog>,
    refreshed_at: Instant,
}

pub struct AppState {
    source: Arc<dyn CatalogSource>,
    revalidate_after: Duration,
    snapshot: Arc<Mutex<Option<Snapshot>>>,
    refreshing: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(source: Arc<dyn CatalogSource>, revalidate_after: Duration) -> Self {
        Self {
            source,
            revalidate_after,
            snapshot: Arc::new(Mutex::new(None)),
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let revalidate_after = config.revalidate_after();
        let pipeline = Pipeline::new(config)?;
        Ok(Self::new(
            Arc::new(PipelineSource::new(pipeline)),
            revalidate_after,
        ))
    }

    /// Returns the cached catalog. Once the revalidation window has passed the
    /// current snapshot is still returned straight away while one background
    /// rebuild replaces it; a failed rebuild keeps the old snapshot and
    /// restarts the window. Only the very first build is awaited.
    pub async fn catalog(&self) -> Result<Arc<Catalog>> {
        let mut guard = self.snapshot.lock().await;
        if let Some(snapshot) = guard.as_ref() {
            let current = snapshot.catalog.clone();
            if snapshot.refreshed_at.elapsed() >= self.revalidate_after {
                drop(guard);
                self.spawn_refresh();
            }
            return Ok(current);
        }

        // Cold start: later callers queue on the lock and share this build.
        let catalog = Arc::new(self.source.build().await.context("building catalog")?);
        info!(
            developments = catalog.developments().len(),
            "catalog built"
        );
        *guard = Some(Snapshot {
            catalog: catalog.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(catalog)
    }

    fn spawn_refresh(&self) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let source = self.source.clone();
        let snapshot = self.snapshot.clone();
        let refreshing = self.refreshing.clone();
        tokio::spawn(async move {
            let result = source.build().await;
            let mut guard = snapshot.lock().await;
            match result {
                Ok(catalog) => {
                    info!(
                        developments = catalog.developments().len(),
                        "catalog refreshed"
                    );
                    *guard = Some(Snapshot {
                        catalog: Arc::new(catalog),
                        refreshed_at: Instant::now(),
                    });
                }
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "catalog rebuild failed; serving stale snapshot"
                    );
                    if let Some(stale) = guard.as_mut() {
                        stale.refreshed_at = Instant::now();
                    }
                }
            }
            refreshing.store(false, Ordering::Release);
        });
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/developments", get(developments_handler))
        .route("/developments/{slug}", get(development_detail_handler))
        .route("/developments/{slug}/units", get(development_units_handler))
        .route("/builders", get(builders_handler))
        .route("/builders/{slug}", get(builder_detail_handler))
        .route("/areas", get(areas_handler))
        .route("/areas/{slug}", get(area_detail_handler))
        .route("/search", get(search_handler))
        .route("/stats", get(stats_handler))
        .route("/tags", get(tags_handler))
        .route("/tags/beach", get(beach_groups_handler))
        .route("/tags/golf", get(golf_groups_handler))
        .route("/tags/price", get(price_groups_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    let config = PipelineConfig::from_env();
    let port = config.web_port;
    let state = AppState::from_config(config)?;
    if let Err(err) = state.catalog().await {
        warn!(error = %format!("{err:#}"), "initial catalog build failed; will retry on request");
    }
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving catalog API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Comma-separated query string form of [`TagFilter`].
#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    tags: Option<String>,
    exclude_tags: Option<String>,
    zones: Option<String>,
    property_types: Option<String>,
    regions: Option<String>,
    statuses: Option<String>,
    price_min: Option<f64>,
    price_max: Option<f64>,
    #[serde(default)]
    beach_only: bool,
    #[serde(default)]
    golf_only: bool,
    sort: Option<String>,
    limit: Option<usize>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl SearchParams {
    fn into_filter(self) -> Result<TagFilter> {
        let statuses = split_list(self.statuses.as_deref())
            .into_iter()
            .map(|s| {
                serde_json::from_value::<ListingStatus>(serde_json::Value::String(s.clone()))
                    .with_context(|| format!("unknown status {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let sort = match self.sort.as_deref() {
            Some(s) => s.parse::<SortKey>()?,
            None => SortKey::default(),
        };
        Ok(TagFilter {
            tags: split_list(self.tags.as_deref()),
            exclude_tags: split_list(self.exclude_tags.as_deref()),
            zones: split_list(self.zones.as_deref()),
            price_min: self.price_min,
            price_max: self.price_max,
            property_types: split_list(self.property_types.as_deref()),
            regions: split_list(self.regions.as_deref()),
            statuses,
            beach_only: self.beach_only,
            golf_only: self.golf_only,
            sort,
            limit: self.limit,
        })
    }
}

#[derive(Serialize)]
struct SearchResponse<'a> {
    total: usize,
    developments: Vec<&'a TaggedDevelopment>,
}

#[derive(Serialize)]
struct BuilderDetail<'a> {
    builder: &'a Builder,
    developments: Vec<&'a TaggedDevelopment>,
}

#[derive(Serialize)]
struct AreaDetail<'a> {
    area: &'a Area,
    developments: Vec<&'a TaggedDevelopment>,
}

#[derive(Serialize)]
struct StatsResponse {
    statistics: Statistics,
    tags: IndexMap<String, usize>,
}

async fn with_catalog(state: &AppState, render: impl FnOnce(&Catalog) -> Response) -> Response {
    match state.catalog().await {
        Ok(catalog) => render(&catalog),
        Err(err) => unavailable(err),
    }
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn developments_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.developments()).into_response()).await
}

async fn development_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    with_catalog(&state, |c| match c.development(&slug) {
        Some(dev) => Json(dev).into_response(),
        None => not_found("development", &slug),
    })
    .await
}

async fn development_units_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    with_catalog(&state, |c| match c.development_units(&slug) {
        Some(units) => Json(units).into_response(),
        None => not_found("development", &slug),
    })
    .await
}

async fn builders_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.builders()).into_response()).await
}

async fn builder_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    with_catalog(&state, |c| match (c.builder(&slug), c.developments_by_builder(&slug)) {
        (Some(builder), Some(developments)) => Json(BuilderDetail {
            builder,
            developments,
        })
        .into_response(),
        _ => not_found("builder", &slug),
    })
    .await
}

async fn areas_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.areas()).into_response()).await
}

async fn area_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    with_catalog(&state, |c| match (c.area(&slug), c.developments_in_area(&slug)) {
        (Some(area), Some(developments)) => Json(AreaDetail { area, developments }).into_response(),
        _ => not_found("area", &slug),
    })
    .await
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let filter = match params.into_filter() {
        Ok(filter) => filter,
        Err(err) => return bad_request(err),
    };
    with_catalog(&state, |c| {
        let developments = c.filter_by_tags(&filter);
        Json(SearchResponse {
            total: developments.len(),
            developments,
        })
        .into_response()
    })
    .await
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| {
        Json(StatsResponse {
            statistics: c.statistics(),
            tags: c.tag_statistics(),
        })
        .into_response()
    })
    .await
}

async fn tags_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| {
        let tags = c.tag_catalog();
        Json(json!({
            "tags": tags.tags(),
            "price_brackets": tags.price_brackets(),
        }))
        .into_response()
    })
    .await
}

async fn beach_groups_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.beach_groups()).into_response()).await
}

async fn golf_groups_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.golf_groups()).into_response()).await
}

async fn price_groups_handler(State(state): State<Arc<AppState>>) -> Response {
    with_catalog(&state, |c| Json(c.price_bracket_groups()).into_response()).await
}

fn not_found(kind: &str, slug: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{kind} {slug:?} not found") })),
    )
        .into_response()
}

fn bad_request(err: anyhow::Error) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("{err:#}") }))).into_response()
}

fn unavailable(err: anyhow::Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use axum::body::Body;
    use axum::http::Request;
    use cbf_catalog::{Gazetteer, GroupingConfig, TagCatalog};
    use cbf_core::Listing;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_app() -> Router {
        let config = PipelineConfig {
            workspace_root: workspace_root(),
            ..PipelineConfig::default()
        };
        app(AppState::from_config(config).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    /// Succeeds on the first build only.
    struct FlakySource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSource for FlakySource {
        async fn build(&self) -> Result<Catalog> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("feed host unreachable");
            }
            let mut listing = Listing::new("test", "t-", "R1");
            listing.development_name = Some("Sample Residences".into());
            listing.town = "Torrevieja".into();
            listing.price = 180_000.0;
            Ok(Catalog::build(
                vec![listing],
                &GroupingConfig::default(),
                &Gazetteer::default(),
                &TagCatalog::default(),
            ))
        }
    }

    struct DownSource;

    #[async_trait]
    impl CatalogSource for DownSource {
        async fn build(&self) -> Result<Catalog> {
            anyhow::bail!("every feed failed")
        }
    }

    #[tokio::test]
    async fn handler_smoke_catalog_routes() {
        let app = fixture_app();

        let (status, body) = get_json(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(&app, "/developments").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.as_array().unwrap().is_empty());

        let (status, body) = get_json(&app, "/developments/gomera-star").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_units"], 2);

        let (status, body) = get_json(&app, "/developments/gomera-star/units").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = get_json(&app, "/areas/torrevieja").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["area"]["slug"], "torrevieja");
        assert!(!body["developments"].as_array().unwrap().is_empty());

        let (status, body) = get_json(&app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["statistics"]["total_developments"].as_u64().unwrap() > 0);
        assert!(body["tags"].get("beach-lover").is_some());

        for uri in ["/builders", "/areas", "/tags", "/tags/beach", "/tags/golf", "/tags/price"] {
            let (status, _) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn unknown_slugs_are_json_404s() {
        let app = fixture_app();
        for uri in [
            "/developments/nowhere",
            "/developments/nowhere/units",
            "/builders/nobody",
            "/areas/atlantis",
        ] {
            let (status, body) = get_json(&app, uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("not found"));
        }
    }

    #[tokio::test]
    async fn search_reads_comma_separated_filters() {
        let app = fixture_app();
        let (status, body) = get_json(
            &app,
            "/search?tags=beach-lover,golf-enthusiast&sort=price-asc&limit=2",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let total = body["total"].as_u64().unwrap();
        assert!(total > 0 && total <= 2);

        let (status, body) = get_json(&app, "/search?statuses=key-ready,off-plan").await;
        assert_eq!(status, StatusCode::OK);
        for dev in body["developments"].as_array().unwrap() {
            let statuses = dev["statuses"].as_array().unwrap();
            assert!(statuses.iter().any(|s| s == "key-ready" || s == "off-plan"));
        }

        let (status, _) = get_json(&app, "/search?sort=cheapest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get_json(&app, "/search?statuses=demolished").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_rebuild_serves_stale_catalog() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
        });
        let app = app(AppState::new(source.clone(), Duration::ZERO));

        let (status, first) = get_json(&app, "/developments").await;
        assert_eq!(status, StatusCode::OK);
        let (status, second) = get_json(&app, "/developments").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(second[0]["slug"], "sample-residences");

        wait_for(|| source.calls.load(Ordering::SeqCst) >= 2).await;
        let (status, third) = get_json(&app, "/developments").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(third, first);
    }

    /// First build answers at once; every later build waits for `release`.
    struct GatedSource {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl CatalogSource for GatedSource {
        async fn build(&self) -> Result<Catalog> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call > 0 {
                self.release.notified().await;
            }
            let mut listing = Listing::new("test", "t-", "R1");
            listing.development_name = Some(format!("Release {}", call + 1));
            listing.town = "Torrevieja".into();
            listing.price = 180_000.0;
            Ok(Catalog::build(
                vec![listing],
                &GroupingConfig::default(),
                &Gazetteer::default(),
                &TagCatalog::default(),
            ))
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn slow_rebuild_does_not_block_readers() {
        let source = Arc::new(GatedSource {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let app = app(AppState::new(source.clone(), Duration::ZERO));

        let (_, body) = get_json(&app, "/developments").await;
        assert_eq!(body[0]["slug"], "release-1");

        for _ in 0..3 {
            let (status, body) =
                tokio::time::timeout(Duration::from_millis(500), get_json(&app, "/stats"))
                    .await
                    .expect("stale snapshot served without waiting for the rebuild");
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["statistics"]["total_developments"], 1);
        }
        wait_for(|| source.calls.load(Ordering::SeqCst) >= 2).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        source.release.notify_one();
        let mut latest = Value::Null;
        for _ in 0..200 {
            let (_, body) = get_json(&app, "/developments").await;
            latest = body[0]["slug"].clone();
            if latest == "release-2" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(latest, "release-2");
    }

    #[tokio::test]
    async fn no_catalog_yet_is_service_unavailable() {
        let app = app(AppState::new(Arc::new(DownSource), Duration::from_secs(60)));
        let (status, body) = get_json(&app, "/developments").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("every feed failed"));

        let (status, _) = get_json(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }
}
