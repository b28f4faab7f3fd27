//! Per-peer circuit breaker
//!
//! Breakers are persisted in the attribute store so every worker delivering
//! to a peer sees the same state. Transitions are pure functions of an event
//! and the current time; the registry commits them with compare-and-set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::clock::{elapsed_since, SharedClock};
use crate::metrics;
use crate::storage::{AttributeStoreExt, SharedStore, StoreError, StoreResult};

const BREAKER_BUCKET: &str = "_circuit_breakers";
const MAX_CAS_ATTEMPTS: usize = 16;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries proceed
    Closed,
    /// Deliveries are skipped until the cooldown has passed
    Open,
    /// One trial delivery decides whether the peer has recovered
    HalfOpen,
}

/// Decision for one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial request
    Trial,
    Blocked,
}

/// Breaker record for a single destination peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub peer_id: String,
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// When the outstanding half-open trial was granted
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: None,
            trial_started_at: None,
        }
    }

    fn cooled_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_failure_time {
            Some(at) => elapsed_since(now, at) >= cooldown,
            None => true,
        }
    }

    /// State as of `now`: an open breaker reads half-open once cooled down
    pub fn effective_state(&self, now: DateTime<Utc>, cooldown: Duration) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooled_down(now, cooldown) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Decide whether a delivery may go out. Returns the transition taken, if any.
    pub fn admit(&mut self, now: DateTime<Utc>, cooldown: Duration) -> (Admission, Option<&'static str>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                if self.cooled_down(now, cooldown) {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started_at = Some(now);
                    (Admission::Trial, Some("open_to_halfopen"))
                } else {
                    (Admission::Blocked, None)
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back does not hold the breaker forever
                let trial_lost = match self.trial_started_at {
                    Some(at) => elapsed_since(now, at) > cooldown,
                    None => true,
                };
                if trial_lost {
                    self.trial_started_at = Some(now);
                    (Admission::Trial, None)
                } else {
                    (Admission::Blocked, None)
                }
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<&'static str> {
        let transition = match self.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => Some("halfopen_to_closed"),
            CircuitState::Open => Some("open_to_closed"),
        };
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_success_time = Some(now);
        self.trial_started_at = None;
        transition
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, failure_threshold: u32) -> Option<&'static str> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::Closed if self.failure_count >= failure_threshold => {
                self.state = CircuitState::Open;
                Some("closed_to_open")
            }
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.trial_started_at = None;
                Some("halfopen_to_open")
            }
            CircuitState::Open => None,
        }
    }
}

/// All breakers of one actor, persisted in the attribute store
pub struct CircuitBreakerRegistry {
    store: SharedStore,
    clock: SharedClock,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(store: SharedStore, clock: SharedClock, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            store,
            clock,
            failure_threshold,
            cooldown,
        }
    }

    /// Apply `event` to the peer's breaker and commit it if it changed
    async fn update<R, F>(&self, peer_id: &str, mut event: F) -> StoreResult<R>
    where
        F: FnMut(&mut CircuitBreaker, DateTime<Utc>) -> R,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get_typed::<CircuitBreaker>(BREAKER_BUCKET, peer_id).await?;
            let (mut breaker, version) = match current {
                Some((breaker, version)) => (breaker, Some(version)),
                None => (CircuitBreaker::new(peer_id), None),
            };
            let before = breaker.clone();
            let result = event(&mut breaker, self.clock.now());

            if breaker == before && version.is_some() {
                return Ok(result);
            }
            if self
                .store
                .compare_and_set_typed(BREAKER_BUCKET, peer_id, version, &breaker)
                .await?
            {
                return Ok(result);
            }
            trace!(peer_id, "Circuit breaker changed concurrently, re-reading");
        }
        Err(StoreError::Conflict(format!("circuit breaker for {}", peer_id)))
    }

    /// Consult the breaker before delivering to `peer_id`
    pub async fn admit(&self, peer_id: &str) -> StoreResult<Admission> {
        let cooldown = self.cooldown;
        let (admission, transition) = self
            .update(peer_id, |breaker, now| breaker.admit(now, cooldown))
            .await?;

        if let Some(transition) = transition {
            info!(
                peer_id,
                cooldown_secs = cooldown.as_secs(),
                "Circuit breaker transitioning from OPEN to HALF-OPEN for recovery test"
            );
            metrics::circuit_breaker_transition(transition);
        }
        if admission == Admission::Blocked {
            trace!(peer_id, "Circuit breaker open, skipping delivery");
        }
        Ok(admission)
    }

    pub async fn record_success(&self, peer_id: &str) -> StoreResult<()> {
        let transition = self
            .update(peer_id, |breaker, now| breaker.record_success(now))
            .await?;
        if let Some(transition) = transition {
            info!(peer_id, transition, "Circuit breaker: recovery successful, closing circuit");
            metrics::circuit_breaker_transition(transition);
        }
        Ok(())
    }

    pub async fn record_failure(&self, peer_id: &str) -> StoreResult<()> {
        let threshold = self.failure_threshold;
        let mut failures = 0;
        let transition = self
            .update(peer_id, |breaker, now| {
                let transition = breaker.record_failure(now, threshold);
                failures = breaker.failure_count;
                transition
            })
            .await?;

        match transition {
            Some(transition) => {
                warn!(
                    peer_id,
                    consecutive_failures = failures,
                    threshold,
                    transition,
                    "Circuit breaker OPENING"
                );
                metrics::circuit_breaker_transition(transition);
            }
            None => debug!(
                peer_id,
                consecutive_failures = failures,
                threshold,
                "Circuit breaker: failure recorded"
            ),
        }
        Ok(())
    }

    /// Persisted record, if the peer was ever contacted
    pub async fn get(&self, peer_id: &str) -> StoreResult<Option<CircuitBreaker>> {
        Ok(self
            .store
            .get_typed::<CircuitBreaker>(BREAKER_BUCKET, peer_id)
            .await?
            .map(|(breaker, _)| breaker))
    }

    /// Effective state; unknown peers are closed
    pub async fn state(&self, peer_id: &str) -> StoreResult<CircuitState> {
        let now = self.clock.now();
        Ok(self
            .get(peer_id)
            .await?
            .map(|breaker| breaker.effective_state(now, self.cooldown))
            .unwrap_or(CircuitState::Closed))
    }

    /// Manual reset. Returns whether a record existed.
    pub async fn reset(&self, peer_id: &str) -> StoreResult<bool> {
        let existed = self.store.delete(BREAKER_BUCKET, peer_id).await?;
        if existed {
            info!(peer_id, "Circuit breaker reset");
            metrics::circuit_breaker_transition("reset");
        }
        Ok(existed)
    }
}
