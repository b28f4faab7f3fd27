//! Attribute Store Trait
//!
//! Every record the callback subsystem keeps (callback state, pending
//! buffers, circuit breakers, suspensions, capability caches, subscriptions)
//! is a JSON attribute in a bucket-scoped namespace. Each attribute carries a
//! version token that increases on every write, which is what the optimistic
//! concurrency in the processor and breaker registry is built on.

use super::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored attribute together with its version token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedAttribute {
    pub value: Value,
    pub version: u64,
}

impl VersionedAttribute {
    /// Decode the stored JSON into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Storage trait for bucket-scoped, versioned JSON attributes
///
/// Implementations must ensure:
/// - `compare_and_set` is atomic with respect to every other write to the same key
/// - versions never go backwards for a key, even across delete and re-create
#[async_trait]
pub trait AttributeStore: Send + Sync {
    /// Read an attribute
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<VersionedAttribute>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, bucket: &str, key: &str, value: Value) -> StoreResult<u64>;

    /// Conditional write.
    ///
    /// `expected = None` succeeds only if the key does not exist;
    /// `expected = Some(v)` succeeds only if the stored version is `v`.
    /// Returns `false` on a version conflict.
    async fn compare_and_set(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> StoreResult<bool>;

    /// Delete an attribute. Returns whether it existed.
    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool>;

    /// All attributes in a bucket, ordered by key
    async fn list(&self, bucket: &str) -> StoreResult<Vec<(String, VersionedAttribute)>>;

    /// Delete every key in `bucket` starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StoreResult<usize>;

    /// Delete a whole bucket
    async fn delete_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.delete_prefix(bucket, "").await.map(|_| ())
    }
}

/// Typed helpers layered over any [`AttributeStore`]
#[async_trait]
pub trait AttributeStoreExt: AttributeStore {
    /// Read and decode, returning the version alongside
    async fn get_typed<T>(&self, bucket: &str, key: &str) -> StoreResult<Option<(T, u64)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(bucket, key).await? {
            Some(attr) => Ok(Some((attr.decode()?, attr.version))),
            None => Ok(None),
        }
    }

    /// Encode and write unconditionally
    async fn put_typed<T>(&self, bucket: &str, key: &str, value: &T) -> StoreResult<u64>
    where
        T: Serialize + Sync,
    {
        self.put(bucket, key, encode(value)?).await
    }

    /// Encode and write conditionally
    async fn compare_and_set_typed<T>(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<u64>,
        value: &T,
    ) -> StoreResult<bool>
    where
        T: Serialize + Sync,
    {
        self.compare_and_set(bucket, key, expected, encode(value)?).await
    }
}

impl<S: AttributeStore + ?Sized> AttributeStoreExt for S {}

pub(crate) fn encode<T: Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}
