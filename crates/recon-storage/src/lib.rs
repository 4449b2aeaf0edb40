//! HTTP plumbing and per-run dataset snapshots for the reconciliation engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-storage";

pub const PORTAL_SNAPSHOT_FILE: &str = "portal_records.json";
pub const REMOTE_SNAPSHOT_FILE: &str = "remote_records.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Longest slice of an error body carried into `FetchError::HttpStatus`.
const ERROR_BODY_LIMIT: usize = 300;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// What a snapshot directory holds and the digests of its two datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub run_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub pipeline_id: String,
    pub portal_records: usize,
    pub remote_records: usize,
    pub portal_sha256: String,
    pub remote_sha256: String,
}

/// Keeps the exact portal and CRM datasets a comparison ran against, one
/// directory per run id. The dataset files use the fixture file names, so a
/// snapshot directory can be replayed as a fixture directory.
#[derive(Debug, Clone)]
pub struct RunSnapshotStore {
    root: PathBuf,
}

impl RunSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub async fn store_run<P: Serialize, R: Serialize>(
        &self,
        run_id: Uuid,
        pipeline_id: &str,
        portal: &[P],
        remote: &[R],
    ) -> anyhow::Result<SnapshotManifest> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

        let portal_bytes = serde_json::to_vec_pretty(portal).context("serializing portal records")?;
        let remote_bytes = serde_json::to_vec_pretty(remote).context("serializing remote records")?;
        write_replacing(&dir.join(PORTAL_SNAPSHOT_FILE), &portal_bytes).await?;
        write_replacing(&dir.join(REMOTE_SNAPSHOT_FILE), &remote_bytes).await?;

        let manifest = SnapshotManifest {
            run_id,
            captured_at: Utc::now(),
            pipeline_id: pipeline_id.to_string(),
            portal_records: portal.len(),
            remote_records: remote.len(),
            portal_sha256: sha256_hex(&portal_bytes),
            remote_sha256: sha256_hex(&remote_bytes),
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        // Written last: a directory without a manifest is an interrupted capture.
        write_replacing(&dir.join(MANIFEST_FILE), &manifest_bytes).await?;
        Ok(manifest)
    }
}

/// Readers see either the previous file or the complete new one.
async fn write_replacing(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let staging = path.with_extension("json.partial");
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    fs::rename(&staging, path)
        .await
        .with_context(|| format!("moving {} into place", staging.display()))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "recon-bot/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("undecodable response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cannot build a resource url from {base}: {reason}")]
    InvalidUrl { base: String, reason: String },
}

/// Append path segments to `base`, percent-encoding each one, so an id like
/// `d1#2` or `a/b` stays a single segment.
pub fn resource_url(base: &str, segments: &[&str]) -> Result<String, FetchError> {
    let invalid = |reason: String| FetchError::InvalidUrl {
        base: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|err| invalid(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("url cannot carry a path".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.into())
}

/// Outgoing request: everything except the method and URL is optional.
#[derive(Debug, Default)]
pub struct ApiRequest<'a> {
    pub bearer_token: Option<&'a str>,
    pub query: Vec<(&'a str, &'a str)>,
    pub json_body: Option<serde_json::Value>,
}

impl<'a> ApiRequest<'a> {
    pub fn bearer(mut self, token: Option<&'a str>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn query(mut self, key: &'a str, value: &'a str) -> Self {
        self.query.push((key, value));
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, FetchError> {
        self.json_body = Some(serde_json::to_value(body).map_err(FetchError::Encode)?);
        Ok(self)
    }
}

/// JSON-over-HTTP client. Each call is a single attempt; failures go back
/// to the caller unchanged.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        url: &str,
        request: ApiRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(Method::GET, url, request).await
    }

    pub async fn put(
        &self,
        url: &str,
        request: ApiRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(Method::PUT, url, request).await
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        request: ApiRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_call", %method, url);
        let mut builder = self.client.request(method, url);
        if let Some(token) = request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        async move {
            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: error_body_excerpt(&body),
                });
            }
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn error_body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.chars().count() <= ERROR_BODY_LIMIT {
        return text.to_string();
    }
    let cut = text.chars().take(ERROR_BODY_LIMIT).collect::<String>();
    format!("{cut}...")
}
