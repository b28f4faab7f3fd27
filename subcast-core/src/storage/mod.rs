//! Persistent storage primitives
//!
//! A generic key-value attribute store with bucket-scoped namespaces and
//! per-key version tokens for compare-and-set updates.

pub mod errors;
mod memory_store;
mod sql_store;
mod traits;

pub use errors::{StoreError, StoreResult};
pub use memory_store::MemoryAttributeStore;
pub use sql_store::SqlAttributeStore;
pub use traits::{AttributeStore, AttributeStoreExt, VersionedAttribute};

use crate::config::{StoreBackend, StoreConfig};
use std::sync::Arc;

/// Shared handle to whichever backend is configured
pub type SharedStore = Arc<dyn AttributeStore>;

/// Build the backend selected in `config`
pub fn open_store(config: &StoreConfig) -> StoreResult<SharedStore> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryAttributeStore::new())),
        StoreBackend::Sqlite => {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Storage(format!("Failed to create data dir: {}", e)))?;
                }
            }
            Ok(Arc::new(SqlAttributeStore::new(&config.path, config.pool_size)?))
        }
    }
}

/// Join key components with `:`. Components must not contain `:` themselves
/// for prefix deletes to stay exact, which holds for peer and subscription ids.
pub fn compose_key(parts: &[&str]) -> String {
    parts.join(":")
}
