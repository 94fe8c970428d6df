//! HTTP feed fetching for CBF: one manual redirect hop, per-request TLS leniency, bounded wait.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cbf-fetch";

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("cbf-feeds/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub source_id: String,
    pub url: String,
    /// Skip certificate validation for this request only.
    pub accept_invalid_certs: bool,
}

impl FeedRequest {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            accept_invalid_certs: false,
        }
    }

    pub fn lenient_tls(mut self, accept_invalid_certs: bool) -> Self {
        self.accept_invalid_certs = accept_invalid_certs;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub source_id: String,
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedFeed {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn redirected(&self) -> bool {
        self.url != self.final_url
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {after:?} fetching {url}")]
    Timeout { url: String, after: Duration },
    #[error("redirect from {url} not followed: {reason}")]
    Redirect { url: String, reason: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Holds a strict and a lenient client, both with automatic redirects off.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    strict: reqwest::Client,
    lenient: reqwest::Client,
    timeout: Duration,
}

impl FeedFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let strict = build_client(&config, false).context("building strict reqwest client")?;
        let lenient = build_client(&config, true).context("building lenient reqwest client")?;
        Ok(Self {
            strict,
            lenient,
            timeout: config.timeout,
        })
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        request: &FeedRequest,
    ) -> Result<FetchedFeed, FetchError> {
        let span = info_span!(
            "feed_fetch",
            %run_id,
            source_id = %request.source_id,
            url = %request.url
        );
        // The client timeout is per request; this bound also covers the redirect hop.
        match tokio::time::timeout(self.timeout, self.fetch_inner(request))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: request.url.clone(),
                after: self.timeout,
            }),
        }
    }

    async fn fetch_inner(&self, request: &FeedRequest) -> Result<FetchedFeed, FetchError> {
        let client = if request.accept_invalid_certs {
            &self.lenient
        } else {
            &self.strict
        };

        let mut resp = self.send(client, &request.url).await?;
        if resp.status().is_redirection() {
            let target = redirect_target(&request.url, &resp)?;
            debug!(%target, status = resp.status().as_u16(), "following redirect");
            resp = self.send(client, target.as_str()).await?;
            if resp.status().is_redirection() {
                return Err(FetchError::Redirect {
                    url: target.to_string(),
                    reason: "more than one redirect".to_string(),
                });
            }
        }

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|err| self.classify(&final_url, err))?
            .to_vec();
        let content_hash = sha256_hex(&body);
        info!(bytes = body.len(), %content_hash, "feed fetched");

        Ok(FetchedFeed {
            source_id: request.source_id.clone(),
            url: request.url.clone(),
            final_url,
            status: status.as_u16(),
            content_type,
            body,
            content_hash,
            fetched_at: Utc::now(),
        })
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<reqwest::Response, FetchError> {
        client
            .get(url)
            .send()
            .await
            .map_err(|err| self.classify(url, err))
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Request(err)
        }
    }
}

fn build_client(
    config: &FetcherConfig,
    accept_invalid_certs: bool,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(accept_invalid_certs);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build()
}

fn redirect_target(origin: &str, resp: &reqwest::Response) -> Result<Url, FetchError> {
    let status: StatusCode = resp.status();
    let location = resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| FetchError::Redirect {
            url: origin.to_string(),
            reason: format!("status {} without a Location header", status.as_u16()),
        })?;

    resp.url().join(location.trim()).map_err(|err| FetchError::Redirect {
        url: origin.to_string(),
        reason: format!("invalid Location {location:?}: {err}"),
    })
}
