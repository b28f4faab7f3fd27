//! In-memory attribute store
//!
//! Used by tests and by single-process deployments that accept losing
//! sequencing state on restart (the worst case is one extra resync round).

use super::errors::StoreResult;
use super::traits::{AttributeStore, VersionedAttribute};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Buckets {
    data: HashMap<String, BTreeMap<String, VersionedAttribute>>,
    /// Highest version ever issued per (bucket, key), kept across deletes
    high_water: HashMap<(String, String), u64>,
}

impl Buckets {
    fn next_version(&mut self, bucket: &str, key: &str) -> u64 {
        let slot = self
            .high_water
            .entry((bucket.to_string(), key.to_string()))
            .or_insert(0);
        *slot += 1;
        *slot
    }

    fn write(&mut self, bucket: &str, key: &str, value: Value) -> u64 {
        let version = self.next_version(bucket, key);
        self.data
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), VersionedAttribute { value, version });
        version
    }
}

/// In-memory attribute store (tokio `RwLock` over nested maps)
#[derive(Clone, Default)]
pub struct MemoryAttributeStore {
    inner: Arc<RwLock<Buckets>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttributeStore for MemoryAttributeStore {
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<VersionedAttribute>> {
        let inner = self.inner.read().await;
        Ok(inner.data.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        Ok(inner.write(bucket, key, value))
    }

    async fn compare_and_set(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let current = inner
            .data
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|attr| attr.version);

        if current != expected {
            return Ok(false);
        }

        inner.write(bucket, key, value);
        Ok(true)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .data
            .get_mut(bucket)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, bucket: &str) -> StoreResult<Vec<(String, VersionedAttribute)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .data
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let Some(entries) = inner.data.get_mut(bucket) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}
