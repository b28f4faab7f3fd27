//! Outbound callback delivery over HTTP

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use std::time::Duration;
use thiserror::Error;

/// Transport-level delivery failures. Any of these counts against the
/// destination peer's circuit breaker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// What the subscriber answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed `Retry-After` header (delta-seconds form)
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status, retry_after: None }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POSTs a callback body to a subscriber
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Clone, Default)]
pub struct HttpCallbackTransport {
    client: reqwest::Client,
}

impl HttpCallbackTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_encoding: Option<&str>,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body);
        if let Some(encoding) = content_encoding {
            let value = HeaderValue::from_str(encoding)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request = request.header(CONTENT_ENCODING, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        Ok(TransportResponse {
            status: response.status().as_u16(),
            retry_after,
        })
    }
}

/// Only the delta-seconds form; HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_success_range() {
        assert!(TransportResponse::new(204).is_success());
        assert!(!TransportResponse::new(429).is_success());
    }
}
