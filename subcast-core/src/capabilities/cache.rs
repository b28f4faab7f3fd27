//! Per-peer capability cache
//!
//! Lazy fetch with a TTL. Per peer the cache moves
//! `Unknown -> Cached(fresh) -> Cached(stale) -> Cached(fresh) ...`, with a
//! fetch on every transition out of `Unknown` or `stale` that a query
//! triggers. A failed fetch keeps whatever was cached before; a peer never
//! successfully fetched stays `Unknown`, which every query treats as
//! "unsupported". Failed fetches are stamped, and queries do not fetch again
//! until `failure_retry` has passed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::fetcher::CapabilityFetcher;
use crate::clock::{elapsed_since, SharedClock};
use crate::metrics;
use crate::peers::TrustDirectoryService;
use crate::storage::{compose_key, AttributeStoreExt, SharedStore};

const BUCKET: &str = "_peer_capabilities";

/// Wait between lazy fetch attempts for a peer whose last fetch failed
pub const DEFAULT_FAILURE_RETRY: Duration = Duration::from_secs(5 * 60);

/// Cached capabilities of one peer, as seen by one actor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub supported_options: BTreeSet<String>,
    pub protocol_version: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl PeerCapabilities {
    pub fn supports(&self, option: &str) -> bool {
        self.supported_options.contains(option)
    }
}

/// Freshness of a peer's cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Unknown,
    Fresh,
    Stale,
}

/// Answers "does peer X support option Y" for every component
pub struct PeerCapabilityCache {
    actor_id: String,
    store: SharedStore,
    fetcher: Arc<dyn CapabilityFetcher>,
    trust: TrustDirectoryService,
    clock: SharedClock,
    ttl: Duration,
    failure_retry: Duration,
}

impl PeerCapabilityCache {
    pub fn new(
        actor_id: impl Into<String>,
        store: SharedStore,
        fetcher: Arc<dyn CapabilityFetcher>,
        trust: TrustDirectoryService,
        clock: SharedClock,
        ttl: Duration,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            store,
            fetcher,
            trust,
            clock,
            ttl,
            failure_retry: DEFAULT_FAILURE_RETRY,
        }
    }

    pub fn with_failure_retry(mut self, failure_retry: Duration) -> Self {
        self.failure_retry = failure_retry;
        self
    }

    fn key(&self, peer_id: &str) -> String {
        compose_key(&[&self.actor_id, peer_id])
    }

    async fn load(&self, peer_id: &str) -> Option<PeerCapabilities> {
        match self.store.get_typed::<PeerCapabilities>(BUCKET, &self.key(peer_id)).await {
            Ok(entry) => entry.map(|(caps, _)| caps),
            Err(e) => {
                warn!(peer_id, error = %e, "Failed to read capability cache entry");
                None
            }
        }
    }

    /// Cached entry without triggering a fetch. Storage errors read as absent.
    pub async fn get(&self, peer_id: &str) -> Option<PeerCapabilities> {
        self.load(peer_id).await.filter(|caps| caps.fetched_at.is_some())
    }

    fn is_fresh(&self, caps: &PeerCapabilities) -> bool {
        caps.fetched_at
            .map(|at| elapsed_since(self.clock.now(), at) < self.ttl)
            .unwrap_or(false)
    }

    fn recently_failed(&self, caps: &PeerCapabilities) -> bool {
        caps.last_failure_at
            .map(|at| elapsed_since(self.clock.now(), at) < self.failure_retry)
            .unwrap_or(false)
    }

    pub async fn status(&self, peer_id: &str) -> CacheStatus {
        match self.get(peer_id).await {
            None => CacheStatus::Unknown,
            Some(caps) if self.is_fresh(&caps) => CacheStatus::Fresh,
            Some(_) => CacheStatus::Stale,
        }
    }

    /// Cached entry, refreshed first if absent or older than the TTL
    async fn current(&self, peer_id: &str) -> Option<PeerCapabilities> {
        let entry = self.load(peer_id).await;
        let skip_fetch = entry
            .as_ref()
            .is_some_and(|caps| self.is_fresh(caps) || self.recently_failed(caps));
        let cached = entry.filter(|caps| caps.fetched_at.is_some());
        if skip_fetch {
            return cached;
        }
        if self.refresh(peer_id).await {
            self.get(peer_id).await
        } else {
            cached
        }
    }

    /// Whether `peer_id` advertises `option`. Unknown peers support nothing.
    pub async fn supports(&self, peer_id: &str, option: &str) -> bool {
        let supported = self
            .current(peer_id)
            .await
            .map(|caps| caps.supports(option))
            .unwrap_or(false);
        debug!(peer_id, option, supported, "Capability lookup");
        supported
    }

    pub async fn get_version(&self, peer_id: &str) -> Option<String> {
        self.current(peer_id).await.and_then(|caps| caps.protocol_version)
    }

    /// Re-fetch the peer's capabilities now. Returns whether the cache was updated.
    pub async fn refresh(&self, peer_id: &str) -> bool {
        let Some(base_url) = self.trust.peer_base_url(peer_id).await else {
            debug!(peer_id, "No trust relationship, capabilities stay unknown");
            return false;
        };

        let fetched = match self.fetcher.fetch(&base_url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(peer_id, base_url = %base_url, error = %e, "Capability fetch failed, keeping cached entry");
                metrics::capability_fetch(false);
                self.record_failure(peer_id).await;
                return false;
            }
        };
        metrics::capability_fetch(true);

        let entry = PeerCapabilities {
            supported_options: fetched.supported_options,
            protocol_version: fetched.protocol_version,
            fetched_at: Some(self.clock.now()),
            last_failure_at: None,
        };

        match self.store.put_typed(BUCKET, &self.key(peer_id), &entry).await {
            Ok(_) => {
                info!(
                    peer_id,
                    options = entry.supported_options.len(),
                    version = entry.protocol_version.as_deref().unwrap_or("-"),
                    "Peer capabilities cached"
                );
                true
            }
            Err(e) => {
                warn!(peer_id, error = %e, "Failed to persist peer capabilities");
                false
            }
        }
    }

    /// Stamp the failure on the entry, leaving any cached options as they were
    async fn record_failure(&self, peer_id: &str) {
        let mut entry = self.load(peer_id).await.unwrap_or_default();
        entry.last_failure_at = Some(self.clock.now());
        if let Err(e) = self.store.put_typed(BUCKET, &self.key(peer_id), &entry).await {
            warn!(peer_id, error = %e, "Failed to record capability fetch failure");
        }
    }

    /// Drop the cached entry so the next query re-fetches
    pub async fn invalidate(&self, peer_id: &str) -> bool {
        self.store.delete(BUCKET, &self.key(peer_id)).await.unwrap_or(false)
    }
}
