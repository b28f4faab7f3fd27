//! Receiver-side application of callbacks to mirrored peer state

mod applier;
mod error;
mod fetch;
mod operations;

pub use applier::{ApplyOutcome, RemoteStateApplier};
pub use error::{ApplyError, ApplyResult};
pub use fetch::{FetchBack, HttpFetchBack};
pub use operations::ListOperation;
