//! Publisher-side subscription records
//!
//! Subscription management (creation, permission checks, expiry) belongs to
//! the application. The callback subsystem only needs to enumerate the
//! subscriptions on a scope and to stamp sequence numbers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{SubcastError, SubcastResult};
use crate::protocol::Scope;
use crate::storage::{compose_key, AttributeStoreExt, SharedStore, StoreError};

const SUBSCRIPTION_BUCKET: &str = "_subscriptions";
const MAX_CAS_ATTEMPTS: usize = 16;

/// A peer's subscription to a scope of this actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub peer_id: String,
    pub target: String,
    #[serde(default)]
    pub subtarget: Option<String>,
    pub callback_url: String,
    /// Last sequence number issued to this subscription
    #[serde(default)]
    pub sequence: u64,
}

impl Subscription {
    pub fn new(
        subscription_id: impl Into<String>,
        peer_id: impl Into<String>,
        scope: &Scope,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            peer_id: peer_id.into(),
            target: scope.target.clone(),
            subtarget: scope.subtarget.clone(),
            callback_url: callback_url.into(),
            sequence: 0,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope {
            target: self.target.clone(),
            subtarget: self.subtarget.clone(),
        }
    }
}

#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// Subscriptions registered on exactly `scope`
    async fn subscriptions_for(&self, scope: &Scope) -> SubcastResult<Vec<Subscription>>;

    async fn get(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<Option<Subscription>>;

    /// Issue the next sequence number for `subscription`
    async fn advance_sequence(&self, subscription: &Subscription) -> SubcastResult<u64>;
}

pub type SubscriptionDirectoryService = Arc<dyn SubscriptionDirectory>;

/// Subscriptions kept in the attribute store
#[derive(Clone)]
pub struct StoreSubscriptionDirectory {
    store: SharedStore,
}

impl StoreSubscriptionDirectory {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn key(peer_id: &str, subscription_id: &str) -> String {
        compose_key(&[peer_id, subscription_id])
    }

    /// Register or replace a subscription
    pub async fn add(&self, subscription: &Subscription) -> SubcastResult<()> {
        let key = Self::key(&subscription.peer_id, &subscription.subscription_id);
        self.store.put_typed(SUBSCRIPTION_BUCKET, &key, subscription).await?;
        debug!(
            peer_id = %subscription.peer_id,
            subscription_id = %subscription.subscription_id,
            scope = %subscription.scope(),
            "Subscription registered"
        );
        Ok(())
    }

    pub async fn remove(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<bool> {
        Ok(self
            .store
            .delete(SUBSCRIPTION_BUCKET, &Self::key(peer_id, subscription_id))
            .await?)
    }
}

#[async_trait]
impl SubscriptionDirectory for StoreSubscriptionDirectory {
    async fn subscriptions_for(&self, scope: &Scope) -> SubcastResult<Vec<Subscription>> {
        let mut matching = Vec::new();
        for (_, attribute) in self.store.list(SUBSCRIPTION_BUCKET).await? {
            let subscription: Subscription = attribute.decode()?;
            if subscription.target == scope.target && subscription.subtarget == scope.subtarget {
                matching.push(subscription);
            }
        }
        Ok(matching)
    }

    async fn get(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<Option<Subscription>> {
        Ok(self
            .store
            .get_typed::<Subscription>(SUBSCRIPTION_BUCKET, &Self::key(peer_id, subscription_id))
            .await?
            .map(|(subscription, _)| subscription))
    }

    async fn advance_sequence(&self, subscription: &Subscription) -> SubcastResult<u64> {
        let key = Self::key(&subscription.peer_id, &subscription.subscription_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut current, version)) =
                self.store.get_typed::<Subscription>(SUBSCRIPTION_BUCKET, &key).await?
            else {
                return Err(SubcastError::UnknownSubscription(key));
            };
            current.sequence += 1;
            if self
                .store
                .compare_and_set_typed(SUBSCRIPTION_BUCKET, &key, Some(version), &current)
                .await?
            {
                return Ok(current.sequence);
            }
        }
        Err(StoreError::Conflict(format!("subscription {}", key)).into())
    }
}
