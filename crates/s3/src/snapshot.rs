//! Snapshot HTTP API client
//!
//! `GET <create_url>` answers `{"status":"ok","snapshot":"<name>"}`;
//! `POST <delete_url>` with form field `snapshot=<name>` answers
//! `{"status":"ok"}`. Failures carry `{"status":"error","msg":"..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use sk_core::{Error, Result, SnapshotApi};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    status: String,
    #[serde(default)]
    snapshot: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// reqwest-backed [`SnapshotApi`]
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
}

impl SnapshotClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build snapshot HTTP client: {e}")))?;
        Ok(Self { http })
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<SnapshotResponse> {
        let response = request.send().await.map_err(|e| request_error(url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| request_error(url, e))?;

        if matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(Error::Network(format!("{status} from {url}")));
        }
        if status != StatusCode::OK {
            return Err(Error::Snapshot(format!(
                "unexpected status code returned from {url}: {status}; response body: {body:?}"
            )));
        }

        let reply: SnapshotResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Snapshot(format!("cannot parse response from {url}: {e}; response body: {body:?}"))
        })?;
        match reply.status.as_str() {
            "ok" => Ok(reply),
            "error" => Err(Error::Snapshot(format!(
                "{url} returned error: {}",
                reply.msg.as_deref().unwrap_or("no message")
            ))),
            other => Err(Error::Snapshot(format!("unknown status {other:?} returned from {url}"))),
        }
    }
}

fn request_error(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Network(format!("timeout calling {url}: {e}"))
    } else if e.is_connect() {
        Error::Network(format!("connection refused by {url}: {e}"))
    } else {
        Error::Network(format!("request to {url} failed: {e}"))
    }
}

#[async_trait]
impl SnapshotApi for SnapshotClient {
    async fn create(&self, create_url: &str) -> Result<String> {
        let reply = self.send(create_url, self.http.get(create_url)).await?;
        match reply.snapshot {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::Snapshot(format!(
                "{create_url} returned no snapshot name"
            ))),
        }
    }

    async fn delete(&self, delete_url: &str, name: &str) -> Result<()> {
        let request = self.http.post(delete_url).form(&[("snapshot", name)]);
        self.send(delete_url, request).await?;
        Ok(())
    }
}
