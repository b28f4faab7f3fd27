//! Reading a publisher's state for low-granularity callbacks

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::error::{ApplyError, ApplyResult};

/// Retrieves the current state behind a fetch-back URL
#[async_trait]
pub trait FetchBack: Send + Sync {
    async fn fetch(&self, peer_id: &str, url: &str) -> ApplyResult<Value>;
}

/// Plain GET with `reqwest`. Authentication towards the peer is the trust
/// layer's concern; wrap the client accordingly.
#[derive(Clone)]
pub struct HttpFetchBack {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetchBack {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FetchBack for HttpFetchBack {
    async fn fetch(&self, _peer_id: &str, url: &str) -> ApplyResult<Value> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApplyError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApplyError::Fetch(format!("{} returned {}", url, status)));
        }
        response.json().await.map_err(|e| ApplyError::Fetch(e.to_string()))
    }
}
