//! Receiver-side callback sequencing
//!
//! Inbound callbacks arrive over HTTP in whatever order the network delivers
//! them. [`CallbackProcessor`] restores per-subscription order, drops
//! duplicates, buffers short gaps and gives up on long ones by resetting the
//! subscription so the application can resynchronise.

mod processor;
mod types;

pub use processor::CallbackProcessor;
pub use types::{
    CallbackHandler, CallbackState, PendingBuffer, PendingCallback, ProcessResult, SequencedCallback,
};
