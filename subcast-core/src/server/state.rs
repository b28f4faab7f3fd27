//! Shared state for the receiving endpoint

use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::{CallbackHandler, CallbackProcessor};
use crate::capabilities::options;
use crate::config::Config;

/// Everything a request handler needs
pub struct AppState {
    pub processor: CallbackProcessor,
    /// Receives callbacks once they are in order
    pub handler: Arc<dyn CallbackHandler>,
    /// Body of `/meta/subcast/supported`
    pub supported_options: String,
    /// Body of `/meta/subcast/version`
    pub protocol_version: String,
    /// Sent as `Retry-After` with 429 responses
    pub retry_after: Duration,
}

impl AppState {
    pub fn new(config: &Config, processor: CallbackProcessor, handler: Arc<dyn CallbackHandler>) -> Self {
        let tags: Vec<String> = config
            .server
            .supported_options
            .iter()
            .map(|tag| tag.trim().to_lowercase())
            .collect();

        Self {
            processor,
            handler,
            supported_options: options::format_tag_list(&tags),
            protocol_version: config.server.protocol_version.clone(),
            retry_after: config.callbacks.retry_after,
        }
    }
}
