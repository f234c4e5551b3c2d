//! Feed gateway contracts + HTTP/file implementations for factsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use factsync_core::RawFact;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "factsync-adapters";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparsable feed payload from {source_name}: {source}")]
    Payload {
        source_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading feed file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            requested_at: Utc::now(),
        }
    }
}

/// Items pulled from one feed fetch, with a digest of the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedBatch {
    pub source: String,
    pub payload_sha256: String,
    pub facts: Vec<RawFact>,
}

#[async_trait]
pub trait FeedGateway: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch(&self, ctx: &FetchContext) -> Result<FeedBatch, FeedError>;
}

pub fn payload_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decodes a feed body: a JSON array of objects carrying a `fact` key.
pub fn parse_feed_payload(source_name: &str, bytes: &[u8]) -> Result<FeedBatch, FeedError> {
    let facts: Vec<RawFact> =
        serde_json::from_slice(bytes).map_err(|source| FeedError::Payload {
            source_name: source_name.to_string(),
            source,
        })?;
    Ok(FeedBatch {
        source: source_name.to_string(),
        payload_sha256: payload_digest(bytes),
        facts,
    })
}

/// Throttling and server-side failures are worth another attempt.
fn status_is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn error_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// How many times a transient feed failure is retried and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub first_pause: Duration,
    pub pause_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_pause: Duration::from_millis(250),
            pause_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause after the `failures`-th failed attempt: doubles each time, capped.
    pub fn pause_after(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures.saturating_sub(1))
            .and_then(|factor| self.first_pause.checked_mul(factor))
            .map_or(self.pause_cap, |pause| pause.min(self.pause_cap))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FeedError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FeedError> {
        let span = info_span!("feed_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FeedError> {
        let mut failures = 0u32;
        loop {
            let (transient, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(bytes = body.len(), failures, "feed fetched");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => (
                    status_is_transient(resp.status()),
                    FeedError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (error_is_transient(&err), FeedError::Request(err)),
            };

            failures += 1;
            if !transient || failures > self.retry.max_retries {
                return Err(err);
            }
            warn!(failures, error = %err, "transient feed failure, retrying");
            tokio::time::sleep(self.retry.pause_after(failures)).await;
        }
    }
}

/// Pulls the feed from a remote JSON document.
#[derive(Debug)]
pub struct HttpFeedGateway {
    url: String,
    http: HttpFetcher,
}

impl HttpFeedGateway {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl FeedGateway for HttpFeedGateway {
    fn source_name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FeedBatch, FeedError> {
        let response = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        parse_feed_payload(&response.final_url, &response.body)
    }
}

/// Reads the feed payload from a local file (offline runs, fixtures).
#[derive(Debug, Clone)]
pub struct FileFeedGateway {
    path: PathBuf,
    name: String,
}

impl FileFeedGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedGateway for FileFeedGateway {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _ctx: &FetchContext) -> Result<FeedBatch, FeedError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FeedError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_feed_payload(&self.name, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn payload_parses_fact_objects_and_ignores_extra_keys() {
        let body = br#"[{"fact": "Dogs are loyal."}, {"fact": "Dogs have 4 legs.", "id": 7}, {}]"#;
        let batch = parse_feed_payload("test", body).unwrap();
        assert_eq!(
            batch.facts,
            vec![
                RawFact::new("Dogs are loyal."),
                RawFact::new("Dogs have 4 legs."),
                RawFact::new(""),
            ]
        );
        assert_eq!(batch.source, "test");
        assert_eq!(batch.payload_sha256, payload_digest(body));
    }

    #[test]
    fn payload_that_is_not_an_array_of_objects_is_rejected() {
        for body in [&br#"{"fact": "x"}"#[..], br#"["x"]"#, b"not json", b""] {
            let err = parse_feed_payload("test", body).unwrap_err();
            assert!(matches!(err, FeedError::Payload { .. }), "{err}");
        }
    }

    #[test]
    fn payload_digest_is_stable() {
        assert_eq!(
            payload_digest(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        assert!(status_is_transient(StatusCode::BAD_GATEWAY));
        assert!(status_is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!status_is_transient(StatusCode::NOT_FOUND));
        assert!(!status_is_transient(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_pause_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            first_pause: Duration::from_millis(100),
            pause_cap: Duration::from_millis(350),
        };

        assert_eq!(policy.pause_after(1), Duration::from_millis(100));
        assert_eq!(policy.pause_after(2), Duration::from_millis(200));
        assert_eq!(policy.pause_after(3), Duration::from_millis(350));
        assert_eq!(policy.pause_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn file_gateway_reads_payload_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("feed.json");
        std::fs::write(&path, r#"[{"fact": "Puppies sleep 18 hours a day!"}]"#).unwrap();

        let gateway = FileFeedGateway::new(&path);
        let batch = gateway.fetch(&FetchContext::new(Uuid::new_v4())).await.unwrap();
        assert_eq!(batch.facts, vec![RawFact::new("Puppies sleep 18 hours a day!")]);
        assert_eq!(batch.source, path.display().to_string());
    }

    #[tokio::test]
    async fn file_gateway_reports_missing_file_as_io_error() {
        let dir = tempdir().expect("tempdir");
        let gateway = FileFeedGateway::new(dir.path().join("missing.json"));
        let err = gateway.fetch(&FetchContext::new(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, FeedError::Io { .. }));
    }
}
