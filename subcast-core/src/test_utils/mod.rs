//! Test doubles for the collaborator traits
//!
//! Available to this crate's tests and, with the `test-utils` feature, to
//! integration tests and downstream test suites.

mod fakes;
mod handlers;
mod harness;

pub use fakes::{MockResponse, MockTransport, RecordedRequest, StaticCapabilityFetcher};
pub use handlers::RecordingHandler;
pub use harness::PublisherHarness;

use std::sync::{Mutex, MutexGuard};

/// Lock ignoring poisoning; a panicking test thread should not hide the
/// state it left behind from the assertion that follows.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
