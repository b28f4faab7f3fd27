use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock;
use crate::capabilities::{CapabilityError, CapabilityFetcher, FetchedCapabilities};
use crate::fanout::{gunzip, CallbackTransport, TransportError, TransportResponse};
use crate::protocol::CallbackEnvelope;

/// Capability fetcher answering from a table keyed by peer base URL.
/// Unknown URLs fail like an unreachable peer.
#[derive(Clone, Default)]
pub struct StaticCapabilityFetcher {
    peers: Arc<Mutex<HashMap<String, Option<FetchedCapabilities>>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl StaticCapabilityFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes `delay` to answer
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn set(&self, base_url: &str, options: &[&str], version: Option<&str>) {
        let capabilities = FetchedCapabilities {
            supported_options: options.iter().map(|o| o.to_string()).collect(),
            protocol_version: version.map(str::to_string),
        };
        lock(&self.peers).insert(base_url.to_string(), Some(capabilities));
    }

    pub async fn fail(&self, base_url: &str) {
        lock(&self.peers).insert(base_url.to_string(), None);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were outstanding at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityFetcher for StaticCapabilityFetcher {
    async fn fetch(&self, base_url: &str) -> Result<FetchedCapabilities, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match lock(&self.peers).get(base_url) {
            Some(Some(capabilities)) => Ok(capabilities.clone()),
            Some(None) => Err(CapabilityError::Request("connection refused".to_string())),
            None => Err(CapabilityError::Status(404)),
        }
    }
}

/// How [`MockTransport`] answers a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockResponse {
    Status(u16),
    RetryAfter(u16, Duration),
    Timeout,
    ConnectionRefused,
}

/// A POST seen by [`MockTransport`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
}

impl RecordedRequest {
    /// Decode the callback body, gunzipping if needed
    pub fn envelope(&self) -> anyhow::Result<CallbackEnvelope> {
        let body = match self.content_encoding.as_deref() {
            Some("gzip") => gunzip(&self.body)?,
            _ => self.body.clone(),
        };
        Ok(serde_json::from_slice(&body)?)
    }
}

#[derive(Default)]
struct MockState {
    responses: HashMap<String, MockResponse>,
    requests: Vec<RecordedRequest>,
}

/// In-process transport: records requests, answers 204 unless told otherwise
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request takes `delay` to answer
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn respond(&self, url: &str, response: MockResponse) {
        lock(&self.state).responses.insert(url.to_string(), response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }

    /// Highest number of requests that were outstanding at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallbackTransport for MockTransport {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let response = {
            let mut state = lock(&self.state);
            state.requests.push(RecordedRequest {
                url: url.to_string(),
                body,
                content_encoding: content_encoding.map(str::to_string),
            });
            state.responses.get(url).copied().unwrap_or(MockResponse::Status(204))
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            MockResponse::Status(status) => Ok(TransportResponse::new(status)),
            MockResponse::RetryAfter(status, after) => Ok(TransportResponse {
                status,
                retry_after: Some(after),
            }),
            MockResponse::Timeout => Err(TransportError::Timeout(timeout)),
            MockResponse::ConnectionRefused => {
                Err(TransportError::Connection("connection refused".to_string()))
            }
        }
    }
}
