//! Peer capability negotiation
//!
//! Every "does this peer support X" decision in the crate goes through
//! [`PeerCapabilityCache`]. Components prefer the richer message when the
//! peer advertises it and fall back to a message every peer understands
//! otherwise.

mod cache;
mod fetcher;
pub mod options;

pub use cache::{CacheStatus, PeerCapabilities, PeerCapabilityCache};
pub use fetcher::{CapabilityError, CapabilityFetcher, FetchedCapabilities, HttpCapabilityFetcher};

/// Capability tag list resource, relative to an actor's root URL
pub const SUPPORTED_PATH: &str = "/meta/subcast/supported";
/// Protocol version resource, relative to an actor's root URL
pub const VERSION_PATH: &str = "/meta/subcast/version";
