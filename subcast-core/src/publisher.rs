//! Publisher-side entry point
//!
//! Wires the suspension gate, subscription directory and fan-out together:
//! the application calls [`Publisher::register_diff`] after every mutation.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::{CapabilityFetcher, PeerCapabilityCache};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::SubcastResult;
use crate::fanout::{CallbackTransport, CircuitBreakerRegistry, Delivery, FanOutManager, FanOutResult};
use crate::metrics;
use crate::peers::TrustDirectoryService;
use crate::protocol::Scope;
use crate::storage::SharedStore;
use crate::subscriptions::SubscriptionDirectoryService;
use crate::suspension::SuspensionCoordinator;

/// What happened to a registered diff
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// The scope is suspended; the diff was dropped
    Suspended,
    NoSubscribers,
    Delivered(FanOutResult),
}

/// External collaborators a publisher runs against
pub struct PublisherDeps {
    pub store: SharedStore,
    pub clock: SharedClock,
    pub trust: TrustDirectoryService,
    pub fetcher: Arc<dyn CapabilityFetcher>,
    pub transport: Arc<dyn CallbackTransport>,
    pub subscriptions: SubscriptionDirectoryService,
}

pub struct Publisher {
    subscriptions: SubscriptionDirectoryService,
    capabilities: Arc<PeerCapabilityCache>,
    suspension: SuspensionCoordinator,
    fanout: FanOutManager,
}

impl Publisher {
    pub fn new(config: &Config, deps: PublisherDeps) -> Self {
        let actor_id = config.server.actor_id.as_str();
        let capabilities = Arc::new(PeerCapabilityCache::new(
            actor_id,
            deps.store.clone(),
            deps.fetcher,
            deps.trust,
            deps.clock.clone(),
            config.capabilities.ttl,
        )
        .with_failure_retry(config.capabilities.failure_retry));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            deps.store.clone(),
            deps.clock.clone(),
            config.fanout.failure_threshold,
            config.fanout.cooldown,
        ));
        let fanout = FanOutManager::new(
            actor_id,
            &config.server.base_url,
            config.fanout.clone(),
            breakers,
            capabilities.clone(),
            deps.transport,
            deps.clock,
        );
        let suspension = SuspensionCoordinator::new(
            deps.store,
            deps.subscriptions.clone(),
            capabilities.clone(),
            fanout.clone(),
        );

        Self {
            subscriptions: deps.subscriptions,
            capabilities,
            suspension,
            fanout,
        }
    }

    pub fn suspension(&self) -> &SuspensionCoordinator {
        &self.suspension
    }

    pub fn fanout(&self) -> &FanOutManager {
        &self.fanout
    }

    pub fn capabilities(&self) -> &PeerCapabilityCache {
        &self.capabilities
    }

    async fn drop_if_suspended(&self, scope: &Scope) -> SubcastResult<bool> {
        let suspended = self
            .suspension
            .is_suspended(&scope.target, scope.subtarget.as_deref())
            .await?;
        if suspended {
            metrics::diff_dropped();
            debug!(scope = %scope, "Scope suspended, diff dropped");
        }
        Ok(suspended)
    }

    /// Deliver a change of `scope` to its subscribers, unless the scope is suspended
    ///
    /// Suspension is checked before and again after the sequences are
    /// stamped. A `suspend` landing after the second check still races this
    /// fan-out; the resync sent on `resume` covers whatever it let through.
    pub async fn register_diff(&self, scope: &Scope, data: Value) -> SubcastResult<DiffOutcome> {
        if self.drop_if_suspended(scope).await? {
            return Ok(DiffOutcome::Suspended);
        }

        let subscriptions = self.subscriptions.subscriptions_for(scope).await?;
        if subscriptions.is_empty() {
            return Ok(DiffOutcome::NoSubscribers);
        }

        let mut deliveries = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            match self.subscriptions.advance_sequence(&subscription).await {
                Ok(sequence) => deliveries.push(Delivery { subscription, sequence }),
                Err(e) => warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Could not stamp sequence, subscription skipped"
                ),
            }
        }

        // Numbers stamped for a dropped diff stay consumed; the resync resets ordering
        if self.drop_if_suspended(scope).await? {
            return Ok(DiffOutcome::Suspended);
        }

        let result = self.fanout.deliver_to_subscribers(deliveries, &data, scope).await;
        Ok(DiffOutcome::Delivered(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::peers::StaticTrustDirectory;
    use crate::storage::MemoryAttributeStore;
    use crate::subscriptions::{StoreSubscriptionDirectory, Subscription, SubscriptionDirectory};
    use crate::test_utils::{MockResponse, MockTransport, PublisherHarness, StaticCapabilityFetcher};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};

    /// Suspends the subscription's scope the first time a sequence is stamped
    struct SuspendWhileStamping {
        inner: StoreSubscriptionDirectory,
        publisher: OnceLock<Weak<Publisher>>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl SubscriptionDirectory for SuspendWhileStamping {
        async fn subscriptions_for(&self, scope: &Scope) -> SubcastResult<Vec<Subscription>> {
            self.inner.subscriptions_for(scope).await
        }

        async fn get(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<Option<Subscription>> {
            self.inner.get(peer_id, subscription_id).await
        }

        async fn advance_sequence(&self, subscription: &Subscription) -> SubcastResult<u64> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(publisher) = self.publisher.get().and_then(Weak::upgrade) {
                    publisher
                        .suspension()
                        .suspend(&subscription.target, subscription.subtarget.as_deref())
                        .await?;
                }
            }
            self.inner.advance_sequence(subscription).await
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.server.actor_id = "me".to_string();
        config.server.base_url = "https://me.example/actor".to_string();
        config
    }

    #[tokio::test]
    async fn test_register_diff_stamps_sequences() {
        let harness = PublisherHarness::new(&config());
        let scope = Scope::new("properties", Some("memory_travel"));
        harness.subscribe("peer1", "s1", &scope, &[]).await.unwrap();

        for expected in 1..=3u64 {
            let outcome = harness.publisher.register_diff(&scope, json!({"k": expected})).await.unwrap();
            let DiffOutcome::Delivered(result) = outcome else {
                panic!("expected delivery, got {:?}", outcome);
            };
            assert_eq!(result.successful, 1);
            assert_eq!(result.results[0].sequence, expected);
        }
        assert_eq!(harness.transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_suspended_scope_drops_diffs() {
        let harness = PublisherHarness::new(&config());
        let travel = Scope::new("properties", Some("memory_travel"));
        let food = Scope::new("properties", Some("memory_food"));
        harness.subscribe("peer1", "travel", &travel, &[]).await.unwrap();
        harness.subscribe("peer1", "food", &food, &[]).await.unwrap();

        harness.publisher.suspension().suspend("properties", Some("memory_travel")).await.unwrap();

        let outcome = harness.publisher.register_diff(&travel, json!({"a": 1})).await.unwrap();
        assert_eq!(outcome, DiffOutcome::Suspended);

        let outcome = harness.publisher.register_diff(&food, json!({"a": 1})).await.unwrap();
        assert!(matches!(outcome, DiffOutcome::Delivered(ref r) if r.successful == 1));

        let requests = harness.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://peer1.example/callbacks/food");
    }

    #[tokio::test]
    async fn test_suspend_during_stamping_drops_diff() {
        let store: SharedStore = Arc::new(MemoryAttributeStore::new());
        let transport = MockTransport::new();
        let trust = StaticTrustDirectory::new();
        trust.insert("peer1", "https://peer1.example").await;
        let directory = Arc::new(SuspendWhileStamping {
            inner: StoreSubscriptionDirectory::new(store.clone()),
            publisher: OnceLock::new(),
            fired: AtomicBool::new(false),
        });
        let publisher = Arc::new(Publisher::new(
            &config(),
            PublisherDeps {
                store,
                clock: Arc::new(ManualClock::default()),
                trust: Arc::new(trust),
                fetcher: Arc::new(StaticCapabilityFetcher::new()),
                transport: Arc::new(transport.clone()),
                subscriptions: directory.clone(),
            },
        ));
        assert!(directory.publisher.set(Arc::downgrade(&publisher)).is_ok());

        let scope = Scope::new("properties", Some("memory_travel"));
        directory
            .inner
            .add(&Subscription::new("s1", "peer1", &scope, "https://peer1.example/callbacks/s1"))
            .await
            .unwrap();

        let outcome = publisher.register_diff(&scope, json!({"a": 1})).await.unwrap();
        assert_eq!(outcome, DiffOutcome::Suspended);
        assert!(transport.requests().is_empty());

        // Resume reconciles with a number past the consumed one
        assert_eq!(publisher.suspension().resume("properties", Some("memory_travel")).await.unwrap(), 1);
        let sent = transport.requests()[0].envelope().unwrap();
        assert_eq!(sent.sequence, 2);
        assert!(sent.data.is_none());
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let harness = PublisherHarness::new(&config());
        let outcome = harness
            .publisher
            .register_diff(&Scope::target("properties"), json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, DiffOutcome::NoSubscribers);
    }

    #[tokio::test]
    async fn test_sequence_advances_even_when_delivery_fails() {
        let harness = PublisherHarness::new(&config());
        let scope = Scope::target("properties");
        harness.subscribe("peer1", "s1", &scope, &[]).await.unwrap();
        harness
            .transport
            .respond("https://peer1.example/callbacks/s1", MockResponse::Status(503));

        harness.publisher.register_diff(&scope, json!({"a": 1})).await.unwrap();
        harness
            .transport
            .respond("https://peer1.example/callbacks/s1", MockResponse::Status(204));
        let outcome = harness.publisher.register_diff(&scope, json!({"a": 2})).await.unwrap();

        // The receiver sees a gap and buffers or resyncs; the sender never reuses a number
        let DiffOutcome::Delivered(result) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(result.results[0].sequence, 2);
    }
}
