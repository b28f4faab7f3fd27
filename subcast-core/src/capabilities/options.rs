//! Capability tags
//!
//! Short strings a peer lists at its capability resource to advertise an
//! optional protocol feature.

use std::collections::BTreeSet;

/// Peer accepts `type = "resync"` callbacks
pub const SUBSCRIPTION_RESYNC: &str = "subscriptionresync";
/// Peer accepts gzip-encoded callback bodies
pub const CALLBACK_COMPRESSION: &str = "callbackcompression";
/// Peer accepts batched subscription operations
pub const SUBSCRIPTION_BATCH: &str = "subscriptionbatch";
/// Peer exposes a subscription health endpoint
pub const SUBSCRIPTION_HEALTH: &str = "subscriptionhealth";
/// Peer exposes a subscription stats endpoint
pub const SUBSCRIPTION_STATS: &str = "subscriptionstats";

/// Parse the comma-separated body of a capability resource
pub fn parse_tag_list(body: &str) -> BTreeSet<String> {
    body.split(',')
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Render tags the way the capability resource serves them
pub fn format_tag_list<'a>(tags: impl IntoIterator<Item = &'a String>) -> String {
    tags.into_iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
