//! Receiver HTTP glue
//!
//! A thin axum layer over [`CallbackProcessor`](crate::callbacks::CallbackProcessor):
//! decode, sequence, map the outcome to a status code.

mod api;
mod handlers;
mod state;

pub use api::build_router;
pub use handlers::{ApiError, ErrorResponse, StatusResponse};
pub use state::AppState;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::callbacks::{CallbackHandler, CallbackProcessor};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::peers::StaticTrustDirectory;
use crate::remote::{HttpFetchBack, RemoteStateApplier};
use crate::storage::SharedStore;

/// HTTP server for inbound callbacks
pub struct CallbackServer {
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl CallbackServer {
    pub fn new(state: Arc<AppState>, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Server whose in-order callbacks update the mirrored peer state in
    /// `store`. Fetch-back URLs and resyncs are read over HTTP; the
    /// configured peer table supplies root URLs after a sequence reset.
    pub fn from_config(config: &Config, store: SharedStore) -> Result<Self> {
        let processor = CallbackProcessor::new(store.clone(), Arc::new(SystemClock), config.callbacks.clone());
        let client = reqwest::Client::builder().build()?;
        let trust: StaticTrustDirectory = config.peers.clone().into_iter().collect();
        let applier = RemoteStateApplier::new(store)
            .with_fetch_back(Arc::new(HttpFetchBack::new(client, config.capabilities.fetch_timeout)))
            .with_trust(Arc::new(trust));
        let handler: Arc<dyn CallbackHandler> = Arc::new(applier);
        let state = Arc::new(AppState::new(config, processor, handler));
        Ok(Self::new(state, config.server.bind_address))
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let router = build_router(self.state);
        info!(addr = %listener.local_addr()?, "Callback endpoint listening");
        axum::serve(listener, router).await?;
        Ok(())
    }
}
