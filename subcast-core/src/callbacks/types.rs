//! Receiver-side sequencing records and outcomes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::protocol::{CallbackType, Scope};

/// Outcome of processing one inbound callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Handled now (together with any buffered successors)
    Processed,
    /// Sequence already handled or already buffered
    Duplicate,
    /// Buffered until the missing predecessors arrive
    Pending,
    /// Gap outlived the gap timeout; state reset, a resync is needed
    ResyncTriggered,
    /// Buffer full or retries exhausted; the sender should back off
    Rejected,
}

impl ProcessResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessResult::Processed => "processed",
            ProcessResult::Duplicate => "duplicate",
            ProcessResult::Pending => "pending",
            ProcessResult::ResyncTriggered => "resync_triggered",
            ProcessResult::Rejected => "rejected",
        }
    }
}

/// Sequencing state per (peer, subscription)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackState {
    pub last_sequence: u64,
    /// Optimistic-lock token; the store's version of this record when read
    #[serde(skip)]
    pub version: u64,
    /// Set by a gap-timeout reset: the next callback becomes the new baseline
    pub resync_pending: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An out-of-order arrival waiting for its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallback {
    pub sequence: u64,
    pub callback_type: CallbackType,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Bounded buffer of pending callbacks, ordered by sequence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingBuffer {
    pub entries: BTreeMap<u64, PendingCallback>,
}

impl PendingBuffer {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry that has waited longest
    pub fn oldest(&self) -> Option<&PendingCallback> {
        self.entries.values().min_by_key(|entry| entry.received_at)
    }

    /// Drop entries at or below `last_sequence`. Returns whether anything was removed.
    pub fn prune_through(&mut self, last_sequence: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|&seq, _| seq > last_sequence);
        before != self.entries.len()
    }

    /// Remove and return the consecutive run starting at `first`
    pub fn take_run_from(&mut self, first: u64) -> Vec<PendingCallback> {
        let mut run = Vec::new();
        let mut next = Some(first);
        while let Some(entry) = next.and_then(|seq| self.entries.remove(&seq)) {
            next = entry.sequence.checked_add(1);
            run.push(entry);
        }
        run
    }
}

/// A callback released to the handler, in sequence order
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedCallback {
    pub peer_id: String,
    pub subscription_id: String,
    pub sequence: u64,
    pub callback_type: CallbackType,
    pub payload: Value,
}

/// Receives callbacks once their order has been established
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(&self, callback: &SequencedCallback) -> anyhow::Result<()>;

    /// A sequence gap outlived the gap timeout and the buffered callbacks
    /// were dropped; `scope` should be read again from the peer.
    async fn resync_required(
        &self,
        _peer_id: &str,
        _subscription_id: &str,
        _scope: &Scope,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
