use std::sync::Arc;

use super::{MockTransport, StaticCapabilityFetcher};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::error::SubcastResult;
use crate::peers::StaticTrustDirectory;
use crate::protocol::Scope;
use crate::publisher::{Publisher, PublisherDeps};
use crate::storage::{MemoryAttributeStore, SharedStore};
use crate::subscriptions::{StoreSubscriptionDirectory, Subscription};

/// A publisher wired to in-memory collaborators
pub struct PublisherHarness {
    pub publisher: Publisher,
    pub store: SharedStore,
    pub clock: ManualClock,
    pub transport: MockTransport,
    pub fetcher: StaticCapabilityFetcher,
    pub trust: StaticTrustDirectory,
    pub subscriptions: StoreSubscriptionDirectory,
}

impl PublisherHarness {
    pub fn new(config: &Config) -> Self {
        Self::with_transport(config, MockTransport::new())
    }

    pub fn with_transport(config: &Config, transport: MockTransport) -> Self {
        let store: SharedStore = Arc::new(MemoryAttributeStore::new());
        let clock = ManualClock::default();
        let fetcher = StaticCapabilityFetcher::new();
        let trust = StaticTrustDirectory::new();
        let subscriptions = StoreSubscriptionDirectory::new(store.clone());

        let publisher = Publisher::new(
            config,
            PublisherDeps {
                store: store.clone(),
                clock: Arc::new(clock.clone()),
                trust: Arc::new(trust.clone()),
                fetcher: Arc::new(fetcher.clone()),
                transport: Arc::new(transport.clone()),
                subscriptions: Arc::new(subscriptions.clone()),
            },
        );

        Self {
            publisher,
            store,
            clock,
            transport,
            fetcher,
            trust,
            subscriptions,
        }
    }

    /// Register `peer_id` as trusted at `https://<peer_id>.example` with the
    /// given capabilities, and subscribe it to `scope`. The callback URL is
    /// `https://<peer_id>.example/callbacks/<subscription_id>`.
    pub async fn subscribe(
        &self,
        peer_id: &str,
        subscription_id: &str,
        scope: &Scope,
        options: &[&str],
    ) -> SubcastResult<Subscription> {
        let base_url = format!("https://{}.example", peer_id);
        self.trust.insert(peer_id, base_url.clone()).await;
        self.fetcher.set(&base_url, options, None).await;

        let subscription = Subscription::new(
            subscription_id,
            peer_id,
            scope,
            format!("{}/callbacks/{}", base_url, subscription_id),
        );
        self.subscriptions.add(&subscription).await?;
        Ok(subscription)
    }
}
