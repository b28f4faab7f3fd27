//! Capability discovery over HTTP

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{options, SUPPORTED_PATH, VERSION_PATH};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability request failed: {0}")]
    Request(String),

    #[error("capability resource returned status {0}")]
    Status(u16),
}

/// What a peer's capability resources returned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedCapabilities {
    pub supported_options: BTreeSet<String>,
    pub protocol_version: Option<String>,
}

/// Reads a peer's capability resources
#[async_trait]
pub trait CapabilityFetcher: Send + Sync {
    async fn fetch(&self, base_url: &str) -> Result<FetchedCapabilities, CapabilityError>;
}

/// `reqwest`-backed fetcher
#[derive(Clone)]
pub struct HttpCapabilityFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCapabilityFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn get_text(&self, url: &str) -> Result<String, CapabilityError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CapabilityError::Request(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(CapabilityError::Status(status.as_u16()));
        }

        response.text().await.map_err(|e| CapabilityError::Request(e.to_string()))
    }
}

#[async_trait]
impl CapabilityFetcher for HttpCapabilityFetcher {
    async fn fetch(&self, base_url: &str) -> Result<FetchedCapabilities, CapabilityError> {
        let base = base_url.trim_end_matches('/');
        let supported = self.get_text(&format!("{}{}", base, SUPPORTED_PATH)).await?;

        // The version resource is optional; older peers only serve the tag list.
        let protocol_version = match self.get_text(&format!("{}{}", base, VERSION_PATH)).await {
            Ok(body) if !body.trim().is_empty() => Some(body.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                debug!(base_url = %base, error = %e, "Peer has no protocol version resource");
                None
            }
        };

        Ok(FetchedCapabilities {
            supported_options: options::parse_tag_list(&supported),
            protocol_version,
        })
    }
}
