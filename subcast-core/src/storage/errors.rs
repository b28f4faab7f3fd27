/*
    errors.rs - Error types for the attribute store

    Covers both backends (memory, SQLite) and the JSON encoding of the
    records kept in them.
*/

use thiserror::Error;

/// Errors that can occur in the storage subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend I/O or SQL failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored record did not decode into the expected type
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Connection pool could not hand out a connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Invalid bucket or key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A compare-and-set loop kept losing to concurrent writers
    #[error("Write conflict on {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
