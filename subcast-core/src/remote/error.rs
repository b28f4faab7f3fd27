use thiserror::Error;

use crate::storage::StoreError;

/// Errors applying a callback to the mirrored state
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Callback body does not have the expected shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Index {index} out of range for '{property}' (length {len})")]
    IndexOutOfRange {
        property: String,
        index: usize,
        len: usize,
    },

    #[error("Property '{0}' is not a list")]
    NotAList(String),

    #[error("Fetch-back failed: {0}")]
    Fetch(String),

    #[error("No root URL known for peer {0}")]
    UnknownPeer(String),
}

pub type ApplyResult<T> = Result<T, ApplyError>;
