//! Scope suspension during bulk mutation
//!
//! While a scope is suspended, diffs for it are dropped instead of being
//! delivered one by one. Resuming tells every subscriber of the scope to
//! re-read its state, in the richest form the subscriber understands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capabilities::options::SUBSCRIPTION_RESYNC;
use crate::capabilities::PeerCapabilityCache;
use crate::error::SubcastResult;
use crate::fanout::FanOutManager;
use crate::metrics;
use crate::protocol::{CallbackEnvelope, Scope};
use crate::storage::{AttributeStoreExt, SharedStore};
use crate::subscriptions::SubscriptionDirectoryService;

const SUSPENSION_BUCKET: &str = "_suspensions";

/// Presence of a record means the scope is suspended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub target: String,
    #[serde(default)]
    pub subtarget: Option<String>,
    pub suspended_at: DateTime<Utc>,
}

impl SuspensionRecord {
    pub fn scope(&self) -> Scope {
        Scope {
            target: self.target.clone(),
            subtarget: self.subtarget.clone(),
        }
    }
}

pub struct SuspensionCoordinator {
    store: SharedStore,
    subscriptions: SubscriptionDirectoryService,
    capabilities: Arc<PeerCapabilityCache>,
    fanout: FanOutManager,
}

impl SuspensionCoordinator {
    pub fn new(
        store: SharedStore,
        subscriptions: SubscriptionDirectoryService,
        capabilities: Arc<PeerCapabilityCache>,
        fanout: FanOutManager,
    ) -> Self {
        Self {
            store,
            subscriptions,
            capabilities,
            fanout,
        }
    }

    /// Suspend diff delivery for a scope. False if it was already suspended.
    pub async fn suspend(&self, target: &str, subtarget: Option<&str>) -> SubcastResult<bool> {
        let scope = Scope::new(target, subtarget);
        let record = SuspensionRecord {
            target: scope.target.clone(),
            subtarget: scope.subtarget.clone(),
            suspended_at: self.fanout.now(),
        };
        let created = self
            .store
            .compare_and_set_typed(SUSPENSION_BUCKET, &scope.storage_key(), None, &record)
            .await?;

        if created {
            info!(scope = %scope, "Scope suspended");
            metrics::suspension("suspend");
        } else {
            debug!(scope = %scope, "Scope already suspended");
        }
        Ok(created)
    }

    /// Lift a suspension and send a resync to every subscription on exactly
    /// this scope. Returns the number of resync notifications sent; 0 if the
    /// scope was not suspended.
    pub async fn resume(&self, target: &str, subtarget: Option<&str>) -> SubcastResult<usize> {
        let scope = Scope::new(target, subtarget);
        if !self.store.delete(SUSPENSION_BUCKET, &scope.storage_key()).await? {
            debug!(scope = %scope, "Resume for a scope that was not suspended");
            return Ok(0);
        }
        metrics::suspension("resume");

        let subscriptions = self.subscriptions.subscriptions_for(&scope).await?;
        let now = self.fanout.now();
        let url = scope.fetch_url(self.fanout.base_url());
        let actor_id = self.fanout.actor_id();

        let mut envelopes = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let sequence = match self.subscriptions.advance_sequence(&subscription).await {
                Ok(sequence) => sequence,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Skipping resync for subscription"
                    );
                    continue;
                }
            };
            let id = subscription.subscription_id.as_str();
            let envelope = if self.capabilities.supports(&subscription.peer_id, SUBSCRIPTION_RESYNC).await {
                CallbackEnvelope::resync(actor_id, id, &scope, sequence, now, url.clone())
            } else {
                // Every peer re-reads the scope on a low-granularity diff
                CallbackEnvelope::fetch_back(actor_id, id, &scope, sequence, now, url.clone())
            };
            envelopes.push((subscription, envelope));
        }

        let result = self.fanout.deliver_envelopes(envelopes).await;
        let sent = result.total - result.circuit_open;
        info!(
            scope = %scope,
            sent,
            delivered = result.successful,
            failed = result.failed,
            "Scope resumed, resync sent to subscribers"
        );
        Ok(sent)
    }

    pub async fn is_suspended(&self, target: &str, subtarget: Option<&str>) -> SubcastResult<bool> {
        let scope = Scope::new(target, subtarget);
        Ok(self.store.get(SUSPENSION_BUCKET, &scope.storage_key()).await?.is_some())
    }

    pub async fn list_all_suspended(&self) -> SubcastResult<Vec<SuspensionRecord>> {
        let mut records = Vec::new();
        for (_, attribute) in self.store.list(SUSPENSION_BUCKET).await? {
            records.push(attribute.decode()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use crate::capabilities::options::{CALLBACK_COMPRESSION, SUBSCRIPTION_RESYNC};
    use crate::config::Config;
    use crate::protocol::{CallbackType, Granularity, Scope};
    use crate::test_utils::PublisherHarness;

    fn config() -> Config {
        let mut config = Config::default();
        config.server.actor_id = "me".to_string();
        config.server.base_url = "https://me.example/actor".to_string();
        config
    }

    #[tokio::test]
    async fn test_suspend_is_idempotent() {
        let harness = PublisherHarness::new(&config());
        let suspension = harness.publisher.suspension();

        assert!(suspension.suspend("properties", Some("memory_travel")).await.unwrap());
        assert!(!suspension.suspend("properties", Some("memory_travel")).await.unwrap());
        assert!(suspension.is_suspended("properties", Some("memory_travel")).await.unwrap());

        let all = suspension.list_all_suspended().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].scope(), Scope::new("properties", Some("memory_travel")));
    }

    #[tokio::test]
    async fn test_suspension_is_scope_exact() {
        let harness = PublisherHarness::new(&config());
        let suspension = harness.publisher.suspension();

        suspension.suspend("properties", Some("memory_travel")).await.unwrap();
        assert!(!suspension.is_suspended("properties", Some("memory_food")).await.unwrap());
        assert!(!suspension.is_suspended("properties", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_without_suspension_sends_nothing() {
        let harness = PublisherHarness::new(&config());
        let scope = Scope::target("properties");
        harness.subscribe("peer1", "s1", &scope, &[]).await.unwrap();

        assert_eq!(harness.publisher.suspension().resume("properties", None).await.unwrap(), 0);
        assert!(harness.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_sends_one_resync_per_subscription() {
        let harness = PublisherHarness::new(&config());
        let scope = Scope::new("properties", Some("memory_travel"));
        for n in 1..=3 {
            harness
                .subscribe(&format!("peer{}", n), &format!("s{}", n), &scope, &[SUBSCRIPTION_RESYNC])
                .await
                .unwrap();
        }
        // Different scope, must not be notified
        harness
            .subscribe("peer4", "s4", &Scope::new("properties", Some("memory_food")), &[SUBSCRIPTION_RESYNC])
            .await
            .unwrap();

        let suspension = harness.publisher.suspension();
        suspension.suspend("properties", Some("memory_travel")).await.unwrap();
        assert_eq!(suspension.resume("properties", Some("memory_travel")).await.unwrap(), 3);
        assert!(!suspension.is_suspended("properties", Some("memory_travel")).await.unwrap());

        let requests = harness.transport.requests();
        assert_eq!(requests.len(), 3);
        for request in requests {
            let envelope = request.envelope().unwrap();
            assert_eq!(envelope.callback_type, Some(CallbackType::Resync));
            assert_eq!(envelope.sequence, 1);
            assert_eq!(
                envelope.url.as_deref(),
                Some("https://me.example/actor/properties/memory_travel")
            );
        }
    }

    #[tokio::test]
    async fn test_resume_falls_back_to_low_granularity() {
        let harness = PublisherHarness::new(&config());
        let scope = Scope::target("properties");
        harness.subscribe("peer1", "s1", &scope, &[SUBSCRIPTION_RESYNC]).await.unwrap();
        harness.subscribe("peer2", "s2", &scope, &[CALLBACK_COMPRESSION]).await.unwrap();

        let suspension = harness.publisher.suspension();
        suspension.suspend("properties", None).await.unwrap();
        assert_eq!(suspension.resume("properties", None).await.unwrap(), 2);

        let legacy = harness.transport.requests_to("https://peer2.example/callbacks/s2");
        let envelope = legacy[0].envelope().unwrap();
        assert_eq!(envelope.callback_type, None);
        assert_eq!(envelope.granularity, Granularity::Low);
        assert!(envelope.data.is_none());

        let body: serde_json::Value = serde_json::from_slice(&legacy[0].body).unwrap();
        assert!(body.get("type").is_none());
    }
}
