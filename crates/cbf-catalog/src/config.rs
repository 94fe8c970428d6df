use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cbf_adapters::FeedFormat;
use cbf_fetch::FetcherConfig;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::grouping::{DevelopmentKeyPolicy, GroupingConfig};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub require_development_name: bool,
    pub price_bucket: f64,
    pub revalidate_secs: u64,
    pub web_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            http_timeout_secs: 30,
            user_agent: "cbf-feeds/0.1".to_string(),
            require_development_name: false,
            price_bucket: 50_000.0,
            revalidate_secs: 3600,
            web_port: 8000,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source; unset or unparsable values keep their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: var("CBF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            http_timeout_secs: parsed_var(&var, "CBF_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: var("CBF_USER_AGENT").unwrap_or(defaults.user_agent),
            require_development_name: var("CBF_REQUIRE_DEVELOPMENT_NAME")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.require_development_name),
            price_bucket: parsed_var(&var, "CBF_PRICE_BUCKET")
                .filter(|v: &f64| *v > 0.0)
                .unwrap_or(defaults.price_bucket),
            revalidate_secs: parsed_var(&var, "CBF_REVALIDATE_SECS")
                .unwrap_or(defaults.revalidate_secs),
            web_port: parsed_var(&var, "CBF_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn grouping_config(&self) -> GroupingConfig {
        GroupingConfig {
            policy: if self.require_development_name {
                DevelopmentKeyPolicy::RequireName
            } else {
                DevelopmentKeyPolicy::Fallback
            },
            price_bucket: self.price_bucket,
        }
    }

    pub fn revalidate_after(&self) -> Duration {
        Duration::from_secs(self.revalidate_secs)
    }

    pub fn feeds_path(&self) -> PathBuf {
        self.workspace_root.join("feeds.yaml")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }
}

fn parsed_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSource {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub format: FeedFormat,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    /// Higher wins when two feeds carry the same reference.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub new_builds_only: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Where a feed body comes from for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrigin<'a> {
    Url(&'a str),
    Fixture(&'a Path),
}

impl FeedSource {
    pub fn id_prefix(&self) -> String {
        self.id_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-", self.source_id))
    }

    /// A live `url` is preferred; `fixture` (relative to the workspace root) serves offline runs.
    pub fn origin(&self) -> Result<FeedOrigin<'_>> {
        match (&self.url, &self.fixture) {
            (Some(url), _) if !url.trim().is_empty() => Ok(FeedOrigin::Url(url.trim())),
            (_, Some(path)) => Ok(FeedOrigin::Fixture(path)),
            _ => bail!("feed {} has neither url nor fixture", self.source_id),
        }
    }
}

impl FeedRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let registry: Self = load_yaml(path)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedSource> {
        self.feeds.iter().filter(|f| f.enabled)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.source_id.trim().is_empty() {
                bail!("feed entry with empty source_id");
            }
            if !seen.insert(feed.source_id.as_str()) {
                bail!("duplicate feed source_id {}", feed.source_id);
            }
            feed.origin()?;
        }
        Ok(())
    }
}

pub(crate) fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_reads_variables_and_keeps_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CBF_HTTP_TIMEOUT_SECS", "12"),
            ("CBF_REQUIRE_DEVELOPMENT_NAME", "true"),
            ("CBF_PRICE_BUCKET", "not-a-number"),
            ("CBF_WEB_PORT", "9100"),
        ]);
        let config = PipelineConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.http_timeout_secs, 12);
        assert!(config.require_development_name);
        assert_eq!(config.price_bucket, 50_000.0);
        assert_eq!(config.web_port, 9100);
        assert_eq!(config.user_agent, "cbf-feeds/0.1");
        assert_eq!(config.grouping_config().policy, DevelopmentKeyPolicy::RequireName);
        assert_eq!(config.fetcher_config().timeout, Duration::from_secs(12));
    }

    #[test]
    fn registry_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.yaml");
        fs::write(
            &path,
            r#"
feeds:
  - source_id: redsp
    display_name: REDSP
    format: kyero
    url: https://feeds.example.com/kyero.xml
    priority: 10
    new_builds_only: true
  - source_id: legacy
    display_name: Legacy export
    enabled: false
    format: legacy
    fixture: fixtures/legacy/sample/bundle.json
"#,
        )
        .unwrap();

        let registry = FeedRegistry::load(&path).unwrap();
        assert_eq!(registry.feeds.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
        let redsp = &registry.feeds[0];
        assert_eq!(redsp.id_prefix(), "redsp-");
        assert_eq!(redsp.origin().unwrap(), FeedOrigin::Url("https://feeds.example.com/kyero.xml"));
        assert!(matches!(registry.feeds[1].origin().unwrap(), FeedOrigin::Fixture(_)));
    }

    #[test]
    fn registry_rejects_duplicates_and_missing_origins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.yaml");

        fs::write(
            &path,
            "feeds:\n  - {source_id: a, display_name: A, format: json, url: 'https://x'}\n  - {source_id: a, display_name: B, format: json, url: 'https://y'}\n",
        )
        .unwrap();
        let err = FeedRegistry::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        fs::write(&path, "feeds:\n  - {source_id: b, display_name: B, format: kyero}\n").unwrap();
        let err = FeedRegistry::load(&path).unwrap_err();
        assert!(err.to_string().contains("neither url nor fixture"));
    }
}
