//! Subscription callback delivery
//!
//! Publisher side: [`Publisher`] gates diffs on scope suspension and fans
//! them out to subscribers with per-peer circuit breaking. Receiver side:
//! [`CallbackProcessor`] restores per-subscription order and hands callbacks
//! to a [`CallbackHandler`] such as [`RemoteStateApplier`]. Both sides ask
//! [`PeerCapabilityCache`] which protocol variants a peer understands.

pub mod callbacks;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod metrics;
pub mod peers;
pub mod protocol;
pub mod publisher;
pub mod remote;
pub mod server;
pub mod storage;
pub mod subscriptions;
pub mod suspension;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Version served at `/meta/subcast/version`
pub const PROTOCOL_VERSION: &str = "1.0";

pub use callbacks::{CallbackHandler, CallbackProcessor, ProcessResult, SequencedCallback};
pub use capabilities::PeerCapabilityCache;
pub use config::Config;
pub use error::{SubcastError, SubcastResult};
pub use fanout::{FanOutManager, FanOutResult};
pub use logging::{init_logging, LogLevel};
pub use protocol::{CallbackEnvelope, CallbackType, Granularity, Scope};
pub use publisher::{DiffOutcome, Publisher, PublisherDeps};
pub use remote::RemoteStateApplier;
pub use server::CallbackServer;
pub use suspension::SuspensionCoordinator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        assert_eq!(Config::default().server.protocol_version, PROTOCOL_VERSION);
    }
}
