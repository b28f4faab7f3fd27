//! Trust relationship lookup
//!
//! Trust management lives outside this crate; the callback subsystem only
//! needs to know where a peer can be reached.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves a peer id to the peer actor's root URL
#[async_trait]
pub trait TrustDirectory: Send + Sync {
    /// Root URL of the peer, or `None` if there is no trust relationship
    async fn peer_base_url(&self, peer_id: &str) -> Option<String>;
}

pub type TrustDirectoryService = Arc<dyn TrustDirectory>;

/// Fixed peer table held in memory
#[derive(Default, Clone)]
pub struct StaticTrustDirectory {
    peers: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticTrustDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, peer_id: impl Into<String>, base_url: impl Into<String>) {
        self.peers.write().await.insert(peer_id.into(), base_url.into());
    }

    pub async fn remove(&self, peer_id: &str) -> bool {
        self.peers.write().await.remove(peer_id).is_some()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticTrustDirectory {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(peers: I) -> Self {
        let peers = peers.into_iter().map(|(id, url)| (id.into(), url.into())).collect();
        Self {
            peers: Arc::new(RwLock::new(peers)),
        }
    }
}

#[async_trait]
impl TrustDirectory for StaticTrustDirectory {
    async fn peer_base_url(&self, peer_id: &str) -> Option<String> {
        self.peers.read().await.get(peer_id).cloned()
    }
}
