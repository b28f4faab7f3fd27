//! Route table

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;
use crate::capabilities::{SUPPORTED_PATH, VERSION_PATH};

/// Build the router for the receiving endpoint and capability resources
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/callbacks/:peer_id/:subscription_id", post(handlers::receive_callback))
        .route(SUPPORTED_PATH, get(handlers::supported_options))
        .route(VERSION_PATH, get(handlers::protocol_version))
        .with_state(state)
}
