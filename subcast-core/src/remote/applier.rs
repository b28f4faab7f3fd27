/*
    RemoteStateApplier - mirrors a peer's state from in-order callbacks

    Each peer gets its own bucket (`remote:<peer_id>`) holding one attribute
    per property. High-granularity diffs are applied entry by entry; resyncs
    and fetched low-granularity callbacks replace the mirrored scope. After a
    sequence reset the scope is read again from the peer's root URL.
*/

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ApplyError, ApplyResult};
use super::fetch::FetchBack;
use super::operations::ListOperation;
use crate::callbacks::{CallbackHandler, SequencedCallback};
use crate::peers::TrustDirectoryService;
use crate::protocol::{CallbackEnvelope, CallbackType, Granularity, Scope};
use crate::storage::{AttributeStoreExt, SharedStore, StoreError};

const MAX_CAS_ATTEMPTS: usize = 16;

/// What applying one callback did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Diff entries applied
    Applied { changes: usize },
    /// Mirrored scope replaced wholesale
    Replaced { properties: usize },
    /// Low-granularity callback and no fetch-back configured
    FetchRequired { url: String },
    /// Nothing to apply
    Skipped,
}

pub struct RemoteStateApplier {
    store: SharedStore,
    fetch_back: Option<Arc<dyn FetchBack>>,
    trust: Option<TrustDirectoryService>,
}

impl RemoteStateApplier {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            fetch_back: None,
            trust: None,
        }
    }

    pub fn with_fetch_back(mut self, fetch_back: Arc<dyn FetchBack>) -> Self {
        self.fetch_back = Some(fetch_back);
        self
    }

    /// Peer root URLs, needed to re-read a scope no callback pointed at
    pub fn with_trust(mut self, trust: TrustDirectoryService) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn bucket(peer_id: &str) -> String {
        format!("remote:{}", peer_id)
    }

    /// Apply a sequenced callback whose payload is the callback envelope
    pub async fn apply(&self, peer_id: &str, callback: &SequencedCallback) -> ApplyResult<ApplyOutcome> {
        let envelope: CallbackEnvelope = serde_json::from_value(callback.payload.clone())
            .map_err(|e| ApplyError::InvalidPayload(e.to_string()))?;
        let subtarget = envelope.subtarget.as_deref();

        if callback.callback_type == CallbackType::Resync || envelope.kind() == CallbackType::Resync {
            return match (envelope.data, envelope.url) {
                (Some(data), _) => self.replace(peer_id, subtarget, data).await,
                (None, Some(url)) => self.fetch_and_replace(peer_id, subtarget, url).await,
                (None, None) => Ok(ApplyOutcome::Skipped),
            };
        }

        match envelope.granularity {
            Granularity::High => match envelope.data {
                Some(Value::Object(changes)) => self.apply_changes(peer_id, changes).await,
                Some(Value::Null) | None => Ok(ApplyOutcome::Skipped),
                Some(_) => Err(ApplyError::InvalidPayload(
                    "high granularity data must be an object".to_string(),
                )),
            },
            Granularity::Low => match envelope.url {
                Some(url) => self.fetch_and_replace(peer_id, subtarget, url).await,
                None => Ok(ApplyOutcome::Skipped),
            },
        }
    }

    async fn apply_changes(&self, peer_id: &str, changes: Map<String, Value>) -> ApplyResult<ApplyOutcome> {
        let bucket = Self::bucket(peer_id);
        let mut applied = 0;

        for (property, change) in changes {
            match ListOperation::from_change(&property, &change)? {
                Some(operation) => {
                    self.apply_list_operation(&bucket, &property, &operation).await?;
                    debug!(peer_id, property = %property, operation = operation.name(), "List operation applied");
                }
                None if change.is_null() => {
                    self.store.delete(&bucket, &property).await?;
                }
                None => {
                    self.store.put(&bucket, &property, change).await?;
                }
            }
            applied += 1;
        }

        Ok(ApplyOutcome::Applied { changes: applied })
    }

    async fn apply_list_operation(
        &self,
        bucket: &str,
        property: &str,
        operation: &ListOperation,
    ) -> ApplyResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut list, version) = match self.store.get(bucket, property).await? {
                Some(attribute) => match attribute.value {
                    Value::Array(items) => (items, Some(attribute.version)),
                    Value::Null => (Vec::new(), Some(attribute.version)),
                    _ => return Err(ApplyError::NotAList(property.to_string())),
                },
                None => (Vec::new(), None),
            };

            operation.apply(property, &mut list)?;
            if self
                .store
                .compare_and_set(bucket, property, version, Value::Array(list))
                .await?
            {
                return Ok(());
            }
        }
        Err(StoreError::Conflict(format!("{}/{}", bucket, property)).into())
    }

    /// Replace the mirrored scope: one property when the callback names a
    /// subtarget, the whole namespace otherwise.
    async fn replace(&self, peer_id: &str, subtarget: Option<&str>, data: Value) -> ApplyResult<ApplyOutcome> {
        let bucket = Self::bucket(peer_id);

        if let Some(property) = subtarget {
            if data.is_null() {
                self.store.delete(&bucket, property).await?;
            } else {
                self.store.put(&bucket, property, data).await?;
            }
            return Ok(ApplyOutcome::Replaced { properties: 1 });
        }

        let Value::Object(properties) = data else {
            return Err(ApplyError::InvalidPayload("full state must be an object".to_string()));
        };
        self.store.delete_bucket(&bucket).await?;
        let mut written = 0;
        for (property, value) in properties {
            if !value.is_null() {
                self.store.put(&bucket, &property, value).await?;
                written += 1;
            }
        }
        info!(peer_id, properties = written, "Mirrored state replaced");
        Ok(ApplyOutcome::Replaced { properties: written })
    }

    /// Read `scope` from the peer and replace the mirrored copy
    pub async fn resync_scope(&self, peer_id: &str, scope: &Scope) -> ApplyResult<ApplyOutcome> {
        let base_url = match &self.trust {
            Some(trust) => trust.peer_base_url(peer_id).await,
            None => None,
        };
        let base_url = base_url.ok_or_else(|| ApplyError::UnknownPeer(peer_id.to_string()))?;
        self.fetch_and_replace(peer_id, scope.subtarget.as_deref(), scope.fetch_url(&base_url))
            .await
    }

    async fn fetch_and_replace(
        &self,
        peer_id: &str,
        subtarget: Option<&str>,
        url: String,
    ) -> ApplyResult<ApplyOutcome> {
        match &self.fetch_back {
            Some(fetch_back) => {
                let data = fetch_back.fetch(peer_id, &url).await?;
                self.replace(peer_id, subtarget, data).await
            }
            None => Ok(ApplyOutcome::FetchRequired { url }),
        }
    }

    pub async fn get(&self, peer_id: &str, property: &str) -> ApplyResult<Option<Value>> {
        Ok(self
            .store
            .get(&Self::bucket(peer_id), property)
            .await?
            .map(|attribute| attribute.value))
    }

    /// The whole mirrored namespace of a peer
    pub async fn properties(&self, peer_id: &str) -> ApplyResult<Map<String, Value>> {
        Ok(self
            .store
            .list(&Self::bucket(peer_id))
            .await?
            .into_iter()
            .map(|(key, attribute)| (key, attribute.value))
            .collect())
    }

    /// Drop everything mirrored from a peer (trust teardown)
    pub async fn clear_peer(&self, peer_id: &str) -> ApplyResult<()> {
        self.store.delete_bucket(&Self::bucket(peer_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl CallbackHandler for RemoteStateApplier {
    async fn handle(&self, callback: &SequencedCallback) -> anyhow::Result<()> {
        match self.apply(&callback.peer_id, callback).await? {
            ApplyOutcome::FetchRequired { url } => info!(
                peer_id = %callback.peer_id,
                sequence = callback.sequence,
                url = %url,
                "Callback requires fetching state from peer"
            ),
            outcome => debug!(
                peer_id = %callback.peer_id,
                sequence = callback.sequence,
                ?outcome,
                "Callback applied"
            ),
        }
        Ok(())
    }

    async fn resync_required(&self, peer_id: &str, subscription_id: &str, scope: &Scope) -> anyhow::Result<()> {
        let outcome = self.resync_scope(peer_id, scope).await?;
        info!(peer_id, subscription_id, scope = %scope, ?outcome, "Scope read again after sequence reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::StaticTrustDirectory;
    use crate::storage::MemoryAttributeStore;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    struct StaticFetch(HashMap<String, Value>);

    #[async_trait]
    impl FetchBack for StaticFetch {
        async fn fetch(&self, _peer_id: &str, url: &str) -> ApplyResult<Value> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| ApplyError::Fetch(format!("{} not found", url)))
        }
    }

    fn sequenced(envelope: &CallbackEnvelope) -> SequencedCallback {
        SequencedCallback {
            peer_id: "peer1".to_string(),
            subscription_id: envelope.subscription_id.clone(),
            sequence: envelope.sequence,
            callback_type: envelope.kind(),
            payload: serde_json::to_value(envelope).unwrap(),
        }
    }

    fn diff(data: Value) -> SequencedCallback {
        let scope = Scope::target("properties");
        sequenced(&CallbackEnvelope::diff("peer1", "s1", &scope, 1, Utc::now(), data))
    }

    fn applier() -> RemoteStateApplier {
        RemoteStateApplier::new(Arc::new(MemoryAttributeStore::new()))
    }

    #[tokio::test]
    async fn test_scalar_set_and_delete() {
        let applier = applier();

        let outcome = applier.apply("peer1", &diff(json!({"name": "Ada", "age": 36}))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied { changes: 2 });
        assert_eq!(applier.get("peer1", "name").await.unwrap(), Some(json!("Ada")));

        applier.apply("peer1", &diff(json!({"age": null}))).await.unwrap();
        assert_eq!(applier.get("peer1", "age").await.unwrap(), None);
        assert_eq!(applier.properties("peer1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_operations() {
        let applier = applier();

        applier
            .apply("peer1", &diff(json!({"memory_travel": {"operation": "append", "item": "Oslo"}})))
            .await
            .unwrap();
        applier
            .apply(
                "peer1",
                &diff(json!({"memory_travel": {"operation": "insert", "index": 0, "item": "Rome"}})),
            )
            .await
            .unwrap();
        applier
            .apply("peer1", &diff(json!({"memory_travel": {"operation": "update", "index": 1, "item": "Bergen"}})))
            .await
            .unwrap();

        assert_eq!(
            applier.get("peer1", "memory_travel").await.unwrap(),
            Some(json!(["Rome", "Bergen"]))
        );
    }

    #[tokio::test]
    async fn test_list_operation_on_scalar_fails() {
        let applier = applier();
        applier.apply("peer1", &diff(json!({"name": "Ada"}))).await.unwrap();

        let err = applier
            .apply("peer1", &diff(json!({"name": {"operation": "append", "item": 1}})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::NotAList(_)));
    }

    #[tokio::test]
    async fn test_resync_with_data_replaces_namespace() {
        let applier = applier();
        applier.apply("peer1", &diff(json!({"old": 1, "kept": 1}))).await.unwrap();

        let scope = Scope::target("properties");
        let mut envelope = CallbackEnvelope::resync("peer1", "s1", &scope, 9, Utc::now(), "u".to_string());
        envelope.data = Some(json!({"kept": 2, "new": [1]}));

        let outcome = applier.apply("peer1", &sequenced(&envelope)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Replaced { properties: 2 });
        assert_eq!(
            Value::Object(applier.properties("peer1").await.unwrap()),
            json!({"kept": 2, "new": [1]})
        );
    }

    #[tokio::test]
    async fn test_low_granularity_without_fetch_back() {
        let applier = applier();
        let scope = Scope::new("properties", Some("memory_travel"));
        let url = scope.fetch_url("https://peer1.example");
        let envelope = CallbackEnvelope::fetch_back("peer1", "s1", &scope, 1, Utc::now(), url.clone());

        let outcome = applier.apply("peer1", &sequenced(&envelope)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::FetchRequired { url });
    }

    #[tokio::test]
    async fn test_low_granularity_with_fetch_back() {
        let scope = Scope::new("properties", Some("memory_travel"));
        let url = scope.fetch_url("https://peer1.example");
        let fetch = StaticFetch(HashMap::from([(url.clone(), json!(["Oslo", "Rome"]))]));
        let applier = applier().with_fetch_back(Arc::new(fetch));

        let envelope = CallbackEnvelope::resync("peer1", "s1", &scope, 4, Utc::now(), url);
        let outcome = applier.apply("peer1", &sequenced(&envelope)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Replaced { properties: 1 });
        assert_eq!(
            applier.get("peer1", "memory_travel").await.unwrap(),
            Some(json!(["Oslo", "Rome"]))
        );
    }

    #[tokio::test]
    async fn test_resync_scope_reads_from_peer_root() {
        let scope = Scope::target("properties");
        let url = scope.fetch_url("https://peer1.example/actor");
        let fetch = StaticFetch(HashMap::from([(url, json!({"a": 2, "b": [1]}))]));
        let trust: StaticTrustDirectory = [("peer1", "https://peer1.example/actor")].into_iter().collect();
        let applier = applier()
            .with_fetch_back(Arc::new(fetch))
            .with_trust(Arc::new(trust));
        applier.apply("peer1", &diff(json!({"a": 1, "stale": true}))).await.unwrap();

        applier.resync_required("peer1", "s1", &scope).await.unwrap();
        assert_eq!(
            Value::Object(applier.properties("peer1").await.unwrap()),
            json!({"a": 2, "b": [1]})
        );

        let err = applier.resync_scope("stranger", &scope).await.unwrap_err();
        assert!(matches!(err, ApplyError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_peers_are_isolated() {
        let applier = applier();
        applier.apply("peer1", &diff(json!({"a": 1}))).await.unwrap();

        assert!(applier.properties("peer2").await.unwrap().is_empty());
        applier.clear_peer("peer1").await.unwrap();
        assert!(applier.properties("peer1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_surfaces_errors() {
        let applier = applier();
        let mut callback = diff(json!({}));
        callback.payload = json!({"not": "an envelope"});
        assert!(applier.handle(&callback).await.is_err());
    }
}
