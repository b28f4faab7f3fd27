use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use super::lock;
use crate::callbacks::{CallbackHandler, SequencedCallback};

/// Handler that records what it was given
#[derive(Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<SequencedCallback>>,
    attempted: Mutex<Vec<u64>>,
    fail_on: HashSet<u64>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that returns an error for the given sequence numbers
    pub fn failing_on(sequences: &[u64]) -> Self {
        Self {
            fail_on: sequences.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Sequences handled successfully, in call order
    pub fn sequences(&self) -> Vec<u64> {
        lock(&self.handled).iter().map(|c| c.sequence).collect()
    }

    /// Every sequence the handler was invoked with, including failures
    pub fn attempted(&self) -> Vec<u64> {
        lock(&self.attempted).clone()
    }

    pub fn callbacks(&self) -> Vec<SequencedCallback> {
        lock(&self.handled).clone()
    }
}

#[async_trait]
impl CallbackHandler for RecordingHandler {
    async fn handle(&self, callback: &SequencedCallback) -> anyhow::Result<()> {
        lock(&self.attempted).push(callback.sequence);
        if self.fail_on.contains(&callback.sequence) {
            anyhow::bail!("refusing sequence {}", callback.sequence);
        }
        lock(&self.handled).push(callback.clone());
        Ok(())
    }
}
