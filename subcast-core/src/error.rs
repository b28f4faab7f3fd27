//! Crate-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::fanout::TransportError;
use crate::logging::LoggingError;
use crate::remote::ApplyError;
use crate::storage::StoreError;

/// Result type for subcast operations
pub type SubcastResult<T> = Result<T, SubcastError>;

/// Errors surfaced by the public component APIs
///
/// Delivery failures to individual peers are not errors at this level: they
/// are recorded per subscriber in a `FanOutResult`. What reaches the caller
/// here is local breakage (storage, configuration, malformed input).
#[derive(Error, Debug)]
pub enum SubcastError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    /// Inbound callback could not be understood
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SubcastError {
    fn from(e: serde_json::Error) -> Self {
        SubcastError::Serialization(e.to_string())
    }
}
