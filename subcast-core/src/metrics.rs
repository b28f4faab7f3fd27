/*
    Metrics - counters and histograms for the callback subsystem

    Provides:
    - Receiver side: callbacks by sequencing result, pending buffer depth
    - Publisher side: deliveries by outcome, fan-out duration, breaker transitions
    - Capability discovery and suspension activity

    Recorded through the `metrics` facade; exporting is left to whatever
    recorder the embedding application installs.
*/

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

const DELIVERIES_DESCRIPTION: &str =
    "Outbound callback deliveries, labeled by outcome (delivered, failed, circuit_open)";

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "subcast_callbacks_total",
        "Inbound callbacks, labeled by result (processed, duplicate, pending, resync_triggered, rejected)"
    );

    describe_counter!(
        "subcast_callback_handler_errors_total",
        "Handler failures while applying in-order callbacks"
    );

    describe_counter!(
        "subcast_callback_lock_conflicts_total",
        "Optimistic-lock conflicts while committing callback state"
    );

    describe_gauge!(
        "subcast_pending_callbacks",
        "Out-of-order callbacks buffered for the most recently touched subscription"
    );

    describe_counter!("subcast_deliveries_total", DELIVERIES_DESCRIPTION);

    describe_histogram!(
        "subcast_fanout_duration_seconds",
        "Wall time of one fan-out batch"
    );

    describe_counter!(
        "subcast_granularity_downgrades_total",
        "Callbacks downgraded to low granularity because of payload size"
    );

    describe_counter!(
        "subcast_circuit_breaker_transitions_total",
        "Circuit breaker state transitions, labeled by transition (closed_to_open, open_to_halfopen, halfopen_to_closed, halfopen_to_open)"
    );

    describe_counter!(
        "subcast_capability_fetches_total",
        "Peer capability discovery requests, labeled by result (success, failure)"
    );

    describe_counter!(
        "subcast_suspensions_total",
        "Scope suspensions, labeled by action (suspend, resume)"
    );

    describe_counter!(
        "subcast_diffs_dropped_total",
        "Diffs dropped because their scope was suspended"
    );
}

pub fn callback_result(result: &'static str) {
    counter!("subcast_callbacks_total", "result" => result).increment(1);
}

pub fn callback_handler_error() {
    counter!("subcast_callback_handler_errors_total").increment(1);
}

pub fn callback_lock_conflict() {
    counter!("subcast_callback_lock_conflicts_total").increment(1);
}

pub fn pending_depth(depth: usize) {
    gauge!("subcast_pending_callbacks").set(depth as f64);
}

pub fn delivery(outcome: &'static str) {
    counter!("subcast_deliveries_total", "outcome" => outcome).increment(1);
}

pub fn fanout_duration(duration: Duration) {
    histogram!("subcast_fanout_duration_seconds").record(duration.as_secs_f64());
}

pub fn granularity_downgrade() {
    counter!("subcast_granularity_downgrades_total").increment(1);
}

/// Record circuit breaker state transition
pub fn circuit_breaker_transition(transition: &'static str) {
    counter!("subcast_circuit_breaker_transitions_total", "transition" => transition).increment(1);
}

pub fn capability_fetch(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("subcast_capability_fetches_total", "result" => result).increment(1);
}

pub fn suspension(action: &'static str) {
    counter!("subcast_suspensions_total", "action" => action).increment(1);
}

pub fn diff_dropped() {
    counter!("subcast_diffs_dropped_total").increment(1);
}
