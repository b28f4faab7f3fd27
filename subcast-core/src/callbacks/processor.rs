/*
    CallbackProcessor - receiver-side ordering for subscription callbacks

    Flow per inbound callback:
    1. Resync callbacks reset the sequencing state and go straight to the handler
    2. Duplicates (sequence <= last) are dropped
    3. The next expected sequence is handled together with any buffered successors
    4. Further ahead, a pending buffer whose oldest entry outlived the gap
       timeout forces a resync; otherwise the callback is buffered, up to max_pending

    State lives in the attribute store and is committed with compare-and-set,
    so any number of worker processes may run this concurrently for the same
    subscription. A lost race is retried with exponential backoff.
*/

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::types::{
    CallbackHandler, CallbackState, PendingBuffer, PendingCallback, ProcessResult, SequencedCallback,
};
use crate::clock::{elapsed_since, SharedClock};
use crate::config::CallbackConfig;
use crate::error::SubcastResult;
use crate::metrics;
use crate::protocol::CallbackType;
use crate::storage::{compose_key, AttributeStoreExt, SharedStore};

const STATE_BUCKET: &str = "_callback_state";
const PENDING_BUCKET: &str = "_callback_pending";

/// Result of one optimistic attempt
enum Attempt {
    Done(ProcessResult),
    Conflict,
}

/// The callback currently being processed
struct Incoming<'a> {
    peer_id: &'a str,
    subscription_id: &'a str,
    sequence: u64,
    callback_type: CallbackType,
    payload: &'a Value,
}

/// Receiver-side sequencer
pub struct CallbackProcessor {
    store: SharedStore,
    clock: SharedClock,
    config: CallbackConfig,
}

impl CallbackProcessor {
    pub fn new(store: SharedStore, clock: SharedClock, config: CallbackConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// Sequence, deduplicate and deliver one inbound callback
    ///
    /// `handler` is invoked only for callbacks released in order, strictly
    /// ascending, at most once per sequence number. A handler error is logged
    /// and does not stop the rest of a consecutive run.
    pub async fn process_callback(
        &self,
        peer_id: &str,
        subscription_id: &str,
        sequence: u64,
        payload: Value,
        callback_type: CallbackType,
        handler: &dyn CallbackHandler,
    ) -> SubcastResult<ProcessResult> {
        let key = compose_key(&[peer_id, subscription_id]);
        let incoming = Incoming {
            peer_id,
            subscription_id,
            sequence,
            callback_type,
            payload: &payload,
        };

        if callback_type == CallbackType::Resync {
            self.apply_resync(&key, &incoming, handler).await?;
            metrics::callback_result(ProcessResult::Processed.as_str());
            return Ok(ProcessResult::Processed);
        }

        for attempt in 0..=self.config.max_retries {
            match self.try_process(&key, &incoming, handler).await? {
                Attempt::Done(result) => {
                    trace!(peer_id, subscription_id, sequence, result = result.as_str(), "Callback sequenced");
                    metrics::callback_result(result.as_str());
                    return Ok(result);
                }
                Attempt::Conflict => {
                    metrics::callback_lock_conflict();
                    if attempt < self.config.max_retries {
                        let backoff = self.backoff(attempt);
                        debug!(
                            peer_id,
                            subscription_id,
                            sequence,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "Callback state changed concurrently, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            peer_id,
            subscription_id,
            sequence,
            retries = self.config.max_retries,
            "Callback rejected: optimistic-lock retries exhausted"
        );
        metrics::callback_result(ProcessResult::Rejected.as_str());
        Ok(ProcessResult::Rejected)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff.saturating_mul(1u32 << attempt.min(16))
    }

    async fn load_state(&self, key: &str) -> SubcastResult<(CallbackState, Option<u64>)> {
        match self.store.get_typed::<CallbackState>(STATE_BUCKET, key).await? {
            Some((mut state, version)) => {
                state.version = version;
                Ok((state, Some(version)))
            }
            None => Ok((CallbackState::default(), None)),
        }
    }

    /// Pending buffer with entries already covered by `last_sequence` dropped
    async fn load_pending(
        &self,
        key: &str,
        last_sequence: u64,
    ) -> SubcastResult<(PendingBuffer, Option<u64>)> {
        match self.store.get_typed::<PendingBuffer>(PENDING_BUCKET, key).await? {
            Some((mut buffer, version)) => {
                buffer.prune_through(last_sequence);
                Ok((buffer, Some(version)))
            }
            None => Ok((PendingBuffer::default(), None)),
        }
    }

    async fn commit_state(
        &self,
        key: &str,
        expected: Option<u64>,
        last_sequence: u64,
        resync_pending: bool,
    ) -> SubcastResult<bool> {
        let state = CallbackState {
            last_sequence,
            version: 0,
            resync_pending,
            updated_at: Some(self.clock.now()),
        };
        Ok(self
            .store
            .compare_and_set_typed(STATE_BUCKET, key, expected, &state)
            .await?)
    }

    async fn try_process(
        &self,
        key: &str,
        incoming: &Incoming<'_>,
        handler: &dyn CallbackHandler,
    ) -> SubcastResult<Attempt> {
        let (state, state_version) = self.load_state(key).await?;
        let sequence = incoming.sequence;

        if !state.resync_pending && sequence <= state.last_sequence {
            debug!(
                peer_id = incoming.peer_id,
                subscription_id = incoming.subscription_id,
                sequence,
                last_sequence = state.last_sequence,
                "Duplicate callback ignored"
            );
            return Ok(Attempt::Done(ProcessResult::Duplicate));
        }

        let (mut pending, pending_version) = self.load_pending(key, state.last_sequence).await?;
        let now = self.clock.now();
        let expected = state.last_sequence.checked_add(1);

        if state.resync_pending || expected == Some(sequence) {
            let mut run = vec![PendingCallback {
                sequence,
                callback_type: incoming.callback_type,
                payload: incoming.payload.clone(),
                received_at: now,
            }];
            if let Some(next) = sequence.checked_add(1) {
                run.extend(pending.take_run_from(next));
            }
            let last = run.last().map_or(sequence, |entry| entry.sequence);

            if !self.commit_state(key, state_version, last, false).await? {
                return Ok(Attempt::Conflict);
            }
            if state.resync_pending {
                info!(
                    peer_id = incoming.peer_id,
                    subscription_id = incoming.subscription_id,
                    sequence,
                    "New sequence baseline after resync reset"
                );
            }

            self.remove_consumed(key, last).await?;
            self.dispatch(incoming.peer_id, incoming.subscription_id, run, handler).await;
            // Entries buffered by a concurrent instance after our pending read
            self.drain_ready(key, incoming.peer_id, incoming.subscription_id, handler)
                .await?;
            return Ok(Attempt::Done(ProcessResult::Processed));
        }

        if let Some(oldest) = pending.oldest() {
            let waited = elapsed_since(now, oldest.received_at);
            if waited > self.config.gap_timeout {
                if !self.commit_state(key, state_version, 0, true).await? {
                    return Ok(Attempt::Conflict);
                }
                self.store.put_typed(PENDING_BUCKET, key, &PendingBuffer::default()).await?;
                info!(
                    peer_id = incoming.peer_id,
                    subscription_id = incoming.subscription_id,
                    last_sequence = state.last_sequence,
                    oldest_pending = oldest.sequence,
                    waited_ms = waited.as_millis() as u64,
                    dropped = pending.len(),
                    "Sequence gap outlived gap timeout, resync required"
                );
                return Ok(Attempt::Done(ProcessResult::ResyncTriggered));
            }
        }

        // Gap: buffer until the predecessors arrive
        if pending.entries.contains_key(&sequence) {
            return Ok(Attempt::Done(ProcessResult::Duplicate));
        }
        if pending.len() >= self.config.max_pending {
            warn!(
                peer_id = incoming.peer_id,
                subscription_id = incoming.subscription_id,
                sequence,
                max_pending = self.config.max_pending,
                "Pending buffer full, rejecting callback"
            );
            return Ok(Attempt::Done(ProcessResult::Rejected));
        }

        pending.entries.insert(
            sequence,
            PendingCallback {
                sequence,
                callback_type: incoming.callback_type,
                payload: incoming.payload.clone(),
                received_at: now,
            },
        );
        if !self
            .store
            .compare_and_set_typed(PENDING_BUCKET, key, pending_version, &pending)
            .await?
        {
            return Ok(Attempt::Conflict);
        }
        metrics::pending_depth(pending.len());
        debug!(
            peer_id = incoming.peer_id,
            subscription_id = incoming.subscription_id,
            sequence,
            expected = state.last_sequence.saturating_add(1),
            depth = pending.len(),
            "Out-of-order callback buffered"
        );

        // A concurrent instance may have advanced the state between our read
        // and the buffer write, leaving the next expected entry stranded here.
        let drained = self
            .drain_ready(key, incoming.peer_id, incoming.subscription_id, handler)
            .await?;
        if drained.contains(&sequence) {
            return Ok(Attempt::Done(ProcessResult::Processed));
        }
        Ok(Attempt::Done(ProcessResult::Pending))
    }

    /// Release buffered runs that follow the committed state, until none is
    /// ready. Returns the sequences handled; a lost race stops the drain, the
    /// winner drains after its own commit.
    async fn drain_ready(
        &self,
        key: &str,
        peer_id: &str,
        subscription_id: &str,
        handler: &dyn CallbackHandler,
    ) -> SubcastResult<Vec<u64>> {
        let mut handled = Vec::new();
        loop {
            let (state, state_version) = self.load_state(key).await?;
            if state.resync_pending {
                return Ok(handled);
            }
            let Some(next) = state.last_sequence.checked_add(1) else {
                return Ok(handled);
            };
            let (mut pending, _) = self.load_pending(key, state.last_sequence).await?;
            let run = pending.take_run_from(next);
            let Some(last) = run.last().map(|entry| entry.sequence) else {
                return Ok(handled);
            };
            if !self.commit_state(key, state_version, last, false).await? {
                return Ok(handled);
            }
            self.remove_consumed(key, last).await?;

            handled.extend(run.iter().map(|entry| entry.sequence));
            debug!(peer_id, subscription_id, through = last, "Drained buffered callbacks");
            self.dispatch(peer_id, subscription_id, run, handler).await;
        }
    }

    /// Drop buffered entries at or below `last` once the state covering them is committed
    async fn remove_consumed(&self, key: &str, last: u64) -> SubcastResult<()> {
        for _ in 0..=self.config.max_retries {
            let Some((mut buffer, version)) =
                self.store.get_typed::<PendingBuffer>(PENDING_BUCKET, key).await?
            else {
                return Ok(());
            };
            if !buffer.prune_through(last) {
                return Ok(());
            }
            if self
                .store
                .compare_and_set_typed(PENDING_BUCKET, key, Some(version), &buffer)
                .await?
            {
                metrics::pending_depth(buffer.len());
                return Ok(());
            }
        }
        // Leftovers are pruned on every later read, so this is only untidy.
        debug!(key, last, "Could not compact pending buffer, leaving it for the next writer");
        Ok(())
    }

    async fn dispatch(
        &self,
        peer_id: &str,
        subscription_id: &str,
        run: Vec<PendingCallback>,
        handler: &dyn CallbackHandler,
    ) {
        for entry in run {
            let callback = SequencedCallback {
                peer_id: peer_id.to_string(),
                subscription_id: subscription_id.to_string(),
                sequence: entry.sequence,
                callback_type: entry.callback_type,
                payload: entry.payload,
            };
            if let Err(e) = handler.handle(&callback).await {
                metrics::callback_handler_error();
                warn!(
                    peer_id,
                    subscription_id,
                    sequence = callback.sequence,
                    error = %e,
                    "Callback handler failed"
                );
            }
        }
    }

    async fn apply_resync(
        &self,
        key: &str,
        incoming: &Incoming<'_>,
        handler: &dyn CallbackHandler,
    ) -> SubcastResult<()> {
        let state = CallbackState {
            last_sequence: incoming.sequence,
            version: 0,
            resync_pending: false,
            updated_at: Some(self.clock.now()),
        };
        self.store.put_typed(STATE_BUCKET, key, &state).await?;
        self.store.put_typed(PENDING_BUCKET, key, &PendingBuffer::default()).await?;

        info!(
            peer_id = incoming.peer_id,
            subscription_id = incoming.subscription_id,
            sequence = incoming.sequence,
            "Resync callback reset sequencing state"
        );

        let callback = SequencedCallback {
            peer_id: incoming.peer_id.to_string(),
            subscription_id: incoming.subscription_id.to_string(),
            sequence: incoming.sequence,
            callback_type: CallbackType::Resync,
            payload: incoming.payload.clone(),
        };
        if let Err(e) = handler.handle(&callback).await {
            metrics::callback_handler_error();
            warn!(
                peer_id = incoming.peer_id,
                subscription_id = incoming.subscription_id,
                error = %e,
                "Resync handler failed"
            );
        }
        Ok(())
    }

    /// Current sequencing state, if any callback has been seen
    pub async fn get_state(
        &self,
        peer_id: &str,
        subscription_id: &str,
    ) -> SubcastResult<Option<CallbackState>> {
        let key = compose_key(&[peer_id, subscription_id]);
        let (state, version) = self.load_state(&key).await?;
        Ok(version.map(|_| state))
    }

    /// Number of buffered out-of-order callbacks
    pub async fn pending_count(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<usize> {
        let key = compose_key(&[peer_id, subscription_id]);
        let (state, _) = self.load_state(&key).await?;
        let (pending, _) = self.load_pending(&key, state.last_sequence).await?;
        Ok(pending.len())
    }

    /// Forget one subscription (subscription teardown)
    pub async fn clear_state(&self, peer_id: &str, subscription_id: &str) -> SubcastResult<()> {
        let key = compose_key(&[peer_id, subscription_id]);
        self.store.delete(STATE_BUCKET, &key).await?;
        self.store.delete(PENDING_BUCKET, &key).await?;
        Ok(())
    }

    /// Forget every subscription of a peer (trust teardown).
    /// Returns the number of subscriptions whose state was removed.
    pub async fn clear_state_for_peer(&self, peer_id: &str) -> SubcastResult<usize> {
        let prefix = format!("{}:", peer_id);
        let removed = self.store.delete_prefix(STATE_BUCKET, &prefix).await?;
        self.store.delete_prefix(PENDING_BUCKET, &prefix).await?;
        info!(peer_id, subscriptions = removed, "Cleared callback state for peer");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryAttributeStore;
    use crate::test_utils::RecordingHandler;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn test_config() -> CallbackConfig {
        CallbackConfig {
            max_pending: 3,
            gap_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            ..CallbackConfig::default()
        }
    }

    fn setup() -> (CallbackProcessor, ManualClock) {
        let clock = ManualClock::default();
        let processor = CallbackProcessor::new(
            Arc::new(MemoryAttributeStore::new()),
            Arc::new(clock.clone()),
            test_config(),
        );
        (processor, clock)
    }

    async fn diff(
        processor: &CallbackProcessor,
        handler: &RecordingHandler,
        sequence: u64,
    ) -> ProcessResult {
        processor
            .process_callback("peer1", "sub1", sequence, json!({"n": sequence}), CallbackType::Diff, handler)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        for seq in 1..=3 {
            assert_eq!(diff(&processor, &handler, seq).await, ProcessResult::Processed);
        }

        assert_eq!(handler.sequences(), vec![1, 2, 3]);
        let state = processor.get_state("peer1", "sub1").await.unwrap().unwrap();
        assert_eq!(state.last_sequence, 3);
        assert!(!state.resync_pending);
    }

    #[tokio::test]
    async fn test_duplicate_is_ignored() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Duplicate);
        assert_eq!(handler.sequences(), vec![1]);
    }

    #[tokio::test]
    async fn test_gap_is_buffered_then_drained() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 3).await, ProcessResult::Pending);
        assert_eq!(diff(&processor, &handler, 4).await, ProcessResult::Pending);
        assert_eq!(diff(&processor, &handler, 3).await, ProcessResult::Duplicate);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 2);
        assert_eq!(handler.sequences(), vec![1]);

        assert_eq!(diff(&processor, &handler, 2).await, ProcessResult::Processed);
        assert_eq!(handler.sequences(), vec![1, 2, 3, 4]);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 0);
        assert_eq!(diff(&processor, &handler, 4).await, ProcessResult::Duplicate);
    }

    #[tokio::test]
    async fn test_full_buffer_rejects() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        for seq in 3..=5 {
            assert_eq!(diff(&processor, &handler, seq).await, ProcessResult::Pending);
        }
        assert_eq!(diff(&processor, &handler, 6).await, ProcessResult::Rejected);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_gap_triggers_resync() {
        let (processor, clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 3).await, ProcessResult::Pending);

        clock.advance(Duration::from_secs(5));
        assert_eq!(diff(&processor, &handler, 4).await, ProcessResult::Pending);

        clock.advance(Duration::from_secs(1));
        assert_eq!(diff(&processor, &handler, 9).await, ProcessResult::ResyncTriggered);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 0);
        let state = processor.get_state("peer1", "sub1").await.unwrap().unwrap();
        assert!(state.resync_pending);

        // Whatever arrives next becomes the new baseline
        assert_eq!(diff(&processor, &handler, 10).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 11).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 10).await, ProcessResult::Duplicate);
        assert_eq!(handler.sequences(), vec![1, 10, 11]);
    }

    #[tokio::test]
    async fn test_late_predecessor_is_processed_after_gap_timeout() {
        let (processor, clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 3).await, ProcessResult::Pending);

        clock.advance(Duration::from_secs(6));
        assert_eq!(diff(&processor, &handler, 2).await, ProcessResult::Processed);

        assert_eq!(handler.sequences(), vec![1, 2, 3]);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 0);
        let state = processor.get_state("peer1", "sub1").await.unwrap().unwrap();
        assert_eq!(state.last_sequence, 3);
        assert!(!state.resync_pending);
    }

    #[tokio::test]
    async fn test_top_of_sequence_range() {
        let (processor, clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, u64::MAX).await, ProcessResult::Pending);

        clock.advance(Duration::from_secs(6));
        assert_eq!(diff(&processor, &handler, 7).await, ProcessResult::ResyncTriggered);

        // The reset baseline accepts the largest sequence, after which nothing is newer
        assert_eq!(diff(&processor, &handler, u64::MAX).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, u64::MAX).await, ProcessResult::Duplicate);
        assert_eq!(diff(&processor, &handler, 8).await, ProcessResult::Duplicate);
        assert_eq!(handler.sequences(), vec![1, u64::MAX]);
    }

    #[tokio::test]
    async fn test_resync_callback_resets_ordering() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 5).await, ProcessResult::Pending);

        let result = processor
            .process_callback(
                "peer1",
                "sub1",
                20,
                json!({"url": "https://peer1.example/properties"}),
                CallbackType::Resync,
                &handler,
            )
            .await
            .unwrap();
        assert_eq!(result, ProcessResult::Processed);
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 0);

        let received = handler.callbacks();
        assert_eq!(received.last().map(|c| c.callback_type), Some(CallbackType::Resync));

        assert_eq!(diff(&processor, &handler, 20).await, ProcessResult::Duplicate);
        assert_eq!(diff(&processor, &handler, 21).await, ProcessResult::Processed);
        assert_eq!(handler.sequences(), vec![1, 20, 21]);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_run() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::failing_on(&[2]);

        assert_eq!(diff(&processor, &handler, 1).await, ProcessResult::Processed);
        assert_eq!(diff(&processor, &handler, 3).await, ProcessResult::Pending);
        assert_eq!(diff(&processor, &handler, 2).await, ProcessResult::Processed);

        assert_eq!(handler.attempted(), vec![1, 2, 3]);
        assert_eq!(handler.sequences(), vec![1, 3]);
        let state = processor.get_state("peer1", "sub1").await.unwrap().unwrap();
        assert_eq!(state.last_sequence, 3);
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        processor
            .process_callback("peer1", "a", 1, json!({}), CallbackType::Diff, &handler)
            .await
            .unwrap();
        let result = processor
            .process_callback("peer1", "b", 1, json!({}), CallbackType::Diff, &handler)
            .await
            .unwrap();
        assert_eq!(result, ProcessResult::Processed);
    }

    #[tokio::test]
    async fn test_clear_state_for_peer() {
        let (processor, _clock) = setup();
        let handler = RecordingHandler::new();

        for sub in ["a", "b"] {
            processor
                .process_callback("peer1", sub, 1, json!({}), CallbackType::Diff, &handler)
                .await
                .unwrap();
        }
        processor
            .process_callback("peer10", "a", 1, json!({}), CallbackType::Diff, &handler)
            .await
            .unwrap();
        processor
            .process_callback("peer1", "a", 4, json!({}), CallbackType::Diff, &handler)
            .await
            .unwrap();

        assert_eq!(processor.clear_state_for_peer("peer1").await.unwrap(), 2);
        assert!(processor.get_state("peer1", "a").await.unwrap().is_none());
        assert_eq!(processor.pending_count("peer1", "a").await.unwrap(), 0);
        assert!(processor.get_state("peer10", "a").await.unwrap().is_some());

        // Sequencing starts over
        let result = processor
            .process_callback("peer1", "a", 1, json!({}), CallbackType::Diff, &handler)
            .await
            .unwrap();
        assert_eq!(result, ProcessResult::Processed);
    }

    #[tokio::test]
    async fn test_concurrent_senders_deliver_each_once() {
        let clock = ManualClock::default();
        let processor = Arc::new(CallbackProcessor::new(
            Arc::new(MemoryAttributeStore::new()),
            Arc::new(clock),
            CallbackConfig {
                max_pending: 100,
                max_retries: 50,
                retry_backoff: Duration::from_millis(1),
                ..CallbackConfig::default()
            },
        ));
        let handler = Arc::new(RecordingHandler::new());

        let mut tasks = tokio::task::JoinSet::new();
        for seq in (1..=20u64).rev() {
            let processor = processor.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                processor
                    .process_callback("peer1", "sub1", seq, json!({}), CallbackType::Diff, handler.as_ref())
                    .await
                    .unwrap()
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_ne!(result.unwrap(), ProcessResult::Rejected);
        }

        let mut handled = handler.sequences();
        handled.sort_unstable();
        assert_eq!(handled, (1..=20).collect::<Vec<_>>());
        assert_eq!(processor.pending_count("peer1", "sub1").await.unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_arrival_order_is_handled_in_order(
            order in Just((1..=12u64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let clock = ManualClock::default();
                let processor = CallbackProcessor::new(
                    Arc::new(MemoryAttributeStore::new()),
                    Arc::new(clock),
                    CallbackConfig { max_pending: 16, ..test_config() },
                );
                let handler = RecordingHandler::new();

                for seq in &order {
                    diff(&processor, &handler, *seq).await;
                }
                // Replays change nothing
                for seq in &order {
                    assert_eq!(diff(&processor, &handler, *seq).await, ProcessResult::Duplicate);
                }

                assert_eq!(handler.sequences(), (1..=12).collect::<Vec<_>>());
            });
        }
    }
}
