/*
    FanOutManager - concurrent delivery of one change to many subscribers

    Per subscriber:
    1. Consult the peer's circuit breaker (open -> skip, half-open -> one trial)
    2. Wait for a permit from the batch semaphore, held until the POST returns
    3. Compress the body if it is large and the peer accepts gzip; the peer's
       capabilities are looked up at most once per batch
    4. POST and feed the outcome back into the breaker

    Deliveries run as independent tasks; one subscriber failing or hanging
    never cancels or delays another beyond the shared permit budget.
*/

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::circuit_breaker::{Admission, CircuitBreakerRegistry};
use super::compression::{gzip, GZIP_ENCODING};
use super::transport::{CallbackTransport, TransportError, TransportResponse};
use crate::capabilities::options::CALLBACK_COMPRESSION;
use crate::capabilities::PeerCapabilityCache;
use crate::clock::SharedClock;
use crate::config::FanOutConfig;
use crate::metrics;
use crate::protocol::{CallbackEnvelope, Granularity, Scope};
use crate::subscriptions::Subscription;

/// One subscriber together with the sequence number stamped for it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: Subscription,
    pub sequence: u64,
}

/// Outcome for a single subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed {
        status: Option<u16>,
        retry_after: Option<Duration>,
        reason: String,
    },
    /// Skipped because the peer's breaker is open
    CircuitOpen,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Failed { .. } => "failed",
            DeliveryOutcome::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberResult {
    pub peer_id: String,
    pub subscription_id: String,
    pub sequence: u64,
    pub granularity: Granularity,
    pub compressed: bool,
    pub outcome: DeliveryOutcome,
}

/// Aggregate of one fan-out batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub circuit_open: usize,
    pub results: Vec<SubscriberResult>,
}

impl FanOutResult {
    fn push(&mut self, result: SubscriberResult) {
        match result.outcome {
            DeliveryOutcome::Delivered { .. } => self.successful += 1,
            DeliveryOutcome::Failed { .. } => self.failed += 1,
            DeliveryOutcome::CircuitOpen => self.circuit_open += 1,
        }
        self.total += 1;
        self.results.push(result);
    }

    pub fn result_for(&self, subscription_id: &str) -> Option<&SubscriberResult> {
        self.results.iter().find(|r| r.subscription_id == subscription_id)
    }
}

/// Delivers callbacks to many subscribers at once
#[derive(Clone)]
pub struct FanOutManager {
    actor_id: Arc<str>,
    base_url: Arc<str>,
    config: FanOutConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    capabilities: Arc<PeerCapabilityCache>,
    transport: Arc<dyn CallbackTransport>,
    clock: SharedClock,
}

impl FanOutManager {
    pub fn new(
        actor_id: &str,
        base_url: &str,
        config: FanOutConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        capabilities: Arc<PeerCapabilityCache>,
        transport: Arc<dyn CallbackTransport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            base_url: base_url.into(),
            config,
            breakers,
            capabilities,
            transport,
            clock,
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Deliver one diff of `scope` to every subscriber in `deliveries`
    ///
    /// Payloads larger than `max_payload_for_high_granularity` bytes are sent
    /// as low-granularity callbacks carrying only the scope's fetch-back URL.
    pub async fn deliver_to_subscribers(
        &self,
        deliveries: Vec<Delivery>,
        payload: &Value,
        scope: &Scope,
    ) -> FanOutResult {
        let payload_size = serde_json::to_vec(payload).map(|body| body.len()).unwrap_or(usize::MAX);
        let downgrade = payload_size > self.config.max_payload_for_high_granularity;
        if downgrade && !deliveries.is_empty() {
            metrics::granularity_downgrade();
            debug!(
                scope = %scope,
                payload_size,
                limit = self.config.max_payload_for_high_granularity,
                "Payload too large for high granularity, sending fetch-back callbacks"
            );
        }

        let now = self.clock.now();
        let fetch_url = scope.fetch_url(&self.base_url);
        let envelopes = deliveries
            .into_iter()
            .map(|delivery| {
                let Delivery { subscription, sequence } = delivery;
                let envelope = if downgrade {
                    CallbackEnvelope::fetch_back(
                        &self.actor_id,
                        &subscription.subscription_id,
                        scope,
                        sequence,
                        now,
                        fetch_url.clone(),
                    )
                } else {
                    CallbackEnvelope::diff(
                        &self.actor_id,
                        &subscription.subscription_id,
                        scope,
                        sequence,
                        now,
                        payload.clone(),
                    )
                };
                (subscription, envelope)
            })
            .collect();

        self.deliver_envelopes(envelopes).await
    }

    /// Deliver prepared envelopes, one per subscription, concurrently
    pub async fn deliver_envelopes(&self, envelopes: Vec<(Subscription, CallbackEnvelope)>) -> FanOutResult {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut compression: HashMap<String, Arc<OnceCell<bool>>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (subscription, envelope) in envelopes {
            let manager = self.clone();
            let permits = permits.clone();
            let accepts_gzip = compression.entry(subscription.peer_id.clone()).or_default().clone();
            tasks.spawn(async move {
                manager
                    .deliver_one(subscription, envelope, permits, accepts_gzip)
                    .await
            });
        }

        let mut result = FanOutResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(subscriber) => result.push(subscriber),
                Err(e) => warn!(error = %e, "Delivery task failed to complete"),
            }
        }

        metrics::fanout_duration(started.elapsed());
        info!(
            total = result.total,
            successful = result.successful,
            failed = result.failed,
            circuit_open = result.circuit_open,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fan-out complete"
        );
        result
    }

    async fn deliver_one(
        &self,
        subscription: Subscription,
        envelope: CallbackEnvelope,
        permits: Arc<Semaphore>,
        accepts_gzip: Arc<OnceCell<bool>>,
    ) -> SubscriberResult {
        let peer_id = subscription.peer_id.as_str();
        let mut result = SubscriberResult {
            peer_id: subscription.peer_id.clone(),
            subscription_id: subscription.subscription_id.clone(),
            sequence: envelope.sequence,
            granularity: envelope.granularity,
            compressed: false,
            outcome: DeliveryOutcome::CircuitOpen,
        };

        let admission = match self.breakers.admit(peer_id).await {
            Ok(admission) => admission,
            Err(e) => {
                // Breaker state is advisory; an unreadable record does not stop delivery
                warn!(peer_id, error = %e, "Circuit breaker unavailable, delivering anyway");
                Admission::Allowed
            }
        };
        if admission == Admission::Blocked {
            metrics::delivery(result.outcome.as_str());
            debug!(peer_id, subscription_id = %subscription.subscription_id, "Delivery skipped, circuit open");
            return result;
        }

        // Closed semaphore cannot happen; it lives as long as the batch
        let _permit = permits.acquire().await.ok();

        let mut body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                result.outcome = DeliveryOutcome::Failed {
                    status: None,
                    retry_after: None,
                    reason: format!("could not encode callback: {}", e),
                };
                metrics::delivery(result.outcome.as_str());
                return result;
            }
        };
        let mut content_encoding = None;
        if body.len() > self.config.compression_threshold
            && *accepts_gzip
                .get_or_init(|| self.capabilities.supports(peer_id, CALLBACK_COMPRESSION))
                .await
        {
            match gzip(&body) {
                Ok(packed) => {
                    body = packed;
                    content_encoding = Some(GZIP_ENCODING);
                    result.compressed = true;
                }
                Err(e) => warn!(peer_id, error = %e, "gzip failed, sending uncompressed"),
            }
        }

        let sent = self
            .transport
            .post(&subscription.callback_url, body, content_encoding, self.config.request_timeout)
            .await;

        result.outcome = self.settle(peer_id, &subscription, sent).await;
        metrics::delivery(result.outcome.as_str());
        result
    }

    /// Map a transport result to an outcome and report it to the breaker
    async fn settle(
        &self,
        peer_id: &str,
        subscription: &Subscription,
        sent: Result<TransportResponse, TransportError>,
    ) -> DeliveryOutcome {
        let subscription_id = subscription.subscription_id.as_str();
        let (outcome, trips_breaker) = match sent {
            Ok(response) if response.is_success() => {
                if let Err(e) = self.breakers.record_success(peer_id).await {
                    warn!(peer_id, error = %e, "Could not record delivery success");
                }
                return DeliveryOutcome::Delivered { status: response.status };
            }
            Ok(response) if response.status == 429 => (
                DeliveryOutcome::Failed {
                    status: Some(429),
                    retry_after: response.retry_after,
                    reason: "subscriber is applying backpressure".to_string(),
                },
                true,
            ),
            Ok(response) if response.status >= 500 => (
                DeliveryOutcome::Failed {
                    status: Some(response.status),
                    retry_after: response.retry_after,
                    reason: "subscriber error".to_string(),
                },
                true,
            ),
            // Reachable peer refusing this callback: not a health signal
            Ok(response) => (
                DeliveryOutcome::Failed {
                    status: Some(response.status),
                    retry_after: None,
                    reason: "callback refused".to_string(),
                },
                false,
            ),
            Err(e) => (
                DeliveryOutcome::Failed {
                    status: None,
                    retry_after: None,
                    reason: e.to_string(),
                },
                true,
            ),
        };

        if let DeliveryOutcome::Failed { status, reason, retry_after } = &outcome {
            warn!(
                peer_id,
                subscription_id,
                status = ?status,
                retry_after_secs = retry_after.map(|d| d.as_secs()),
                reason = %reason,
                "Callback delivery failed"
            );
        }
        if trips_breaker {
            if let Err(e) = self.breakers.record_failure(peer_id).await {
                warn!(peer_id, error = %e, "Could not record delivery failure");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::options::SUBSCRIPTION_RESYNC;
    use crate::clock::ManualClock;
    use crate::fanout::CircuitState;
    use crate::peers::StaticTrustDirectory;
    use crate::storage::MemoryAttributeStore;
    use crate::test_utils::{MockResponse, MockTransport, StaticCapabilityFetcher};
    use serde_json::json;

    struct Fixture {
        manager: FanOutManager,
        transport: MockTransport,
        fetcher: StaticCapabilityFetcher,
        clock: ManualClock,
    }

    async fn fixture(config: FanOutConfig, transport: MockTransport) -> Fixture {
        fixture_with(config, transport, StaticCapabilityFetcher::new()).await
    }

    async fn fixture_with(
        config: FanOutConfig,
        transport: MockTransport,
        fetcher: StaticCapabilityFetcher,
    ) -> Fixture {
        let store: crate::storage::SharedStore = Arc::new(MemoryAttributeStore::new());
        let clock = ManualClock::default();
        let trust = StaticTrustDirectory::new();
        for n in 1..=5 {
            trust.insert(format!("peer{}", n), format!("https://peer{}.example", n)).await;
        }
        let capabilities = Arc::new(PeerCapabilityCache::new(
            "me",
            store.clone(),
            Arc::new(fetcher.clone()),
            Arc::new(trust),
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            store,
            Arc::new(clock.clone()),
            config.failure_threshold,
            config.cooldown,
        ));
        let manager = FanOutManager::new(
            "me",
            "https://me.example/actor",
            config,
            breakers,
            capabilities,
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
        );
        Fixture { manager, transport, fetcher, clock }
    }

    fn delivery(n: u32, sequence: u64) -> Delivery {
        let scope = Scope::new("properties", Some("memory_travel"));
        Delivery {
            subscription: Subscription::new(
                format!("sub{}", n),
                format!("peer{}", n),
                &scope,
                format!("https://peer{}.example/callbacks", n),
            ),
            sequence,
        }
    }

    fn scope() -> Scope {
        Scope::new("properties", Some("memory_travel"))
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_its_own_sequence() {
        let fx = fixture(FanOutConfig::default(), MockTransport::new()).await;

        let result = fx
            .manager
            .deliver_to_subscribers(vec![delivery(1, 7), delivery(2, 3)], &json!({"a": 1}), &scope())
            .await;

        assert_eq!((result.total, result.successful, result.failed), (2, 2, 0));
        let sent = fx.transport.requests_to("https://peer1.example/callbacks");
        let envelope = sent[0].envelope().unwrap();
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.subscription_id, "sub1");
        assert_eq!(envelope.granularity, Granularity::High);
        assert_eq!(envelope.data, Some(json!({"a": 1})));
        let other = fx.transport.requests_to("https://peer2.example/callbacks")[0].envelope().unwrap();
        assert_eq!(other.sequence, 3);
    }

    #[tokio::test]
    async fn test_granularity_downgrade_boundary() {
        let payload = json!({"text": "x".repeat(100)});
        let size = serde_json::to_vec(&payload).unwrap().len();

        let at_limit = FanOutConfig { max_payload_for_high_granularity: size, ..FanOutConfig::default() };
        let fx = fixture(at_limit, MockTransport::new()).await;
        let result = fx.manager.deliver_to_subscribers(vec![delivery(1, 1)], &payload, &scope()).await;
        assert_eq!(result.results[0].granularity, Granularity::High);

        let below = FanOutConfig { max_payload_for_high_granularity: size - 1, ..FanOutConfig::default() };
        let fx = fixture(below, MockTransport::new()).await;
        let result = fx.manager.deliver_to_subscribers(vec![delivery(1, 1)], &payload, &scope()).await;
        assert_eq!(result.results[0].granularity, Granularity::Low);

        let envelope = fx.transport.requests()[0].envelope().unwrap();
        assert!(envelope.data.is_none());
        assert_eq!(
            envelope.url.as_deref(),
            Some("https://me.example/actor/properties/memory_travel")
        );
    }

    #[tokio::test]
    async fn test_compression_only_for_capable_peers() {
        let config = FanOutConfig { compression_threshold: 64, ..FanOutConfig::default() };
        let fx = fixture(config, MockTransport::new()).await;
        fx.fetcher.set("https://peer1.example", &[CALLBACK_COMPRESSION], None).await;
        fx.fetcher.set("https://peer2.example", &[SUBSCRIPTION_RESYNC], None).await;

        let big = json!({"text": "memory ".repeat(50)});
        let result = fx
            .manager
            .deliver_to_subscribers(vec![delivery(1, 1), delivery(2, 1)], &big, &scope())
            .await;
        assert!(result.result_for("sub1").unwrap().compressed);
        assert!(!result.result_for("sub2").unwrap().compressed);

        let packed = &fx.transport.requests_to("https://peer1.example/callbacks")[0];
        assert_eq!(packed.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(packed.envelope().unwrap().data, Some(big.clone()));

        // Small bodies are never compressed
        let result = fx.manager.deliver_to_subscribers(vec![delivery(1, 2)], &json!({}), &scope()).await;
        assert!(!result.results[0].compressed);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let fx = fixture(FanOutConfig::default(), MockTransport::new()).await;
        fx.transport.respond("https://peer1.example/callbacks", MockResponse::Status(503));
        fx.transport.respond("https://peer2.example/callbacks", MockResponse::Timeout);
        fx.transport.respond(
            "https://peer3.example/callbacks",
            MockResponse::RetryAfter(429, Duration::from_secs(30)),
        );
        fx.transport.respond("https://peer4.example/callbacks", MockResponse::Status(400));

        let deliveries = (1..=5).map(|n| delivery(n, 1)).collect();
        let result = fx.manager.deliver_to_subscribers(deliveries, &json!({"a": 1}), &scope()).await;

        assert_eq!((result.total, result.successful, result.failed), (5, 1, 4));
        assert!(matches!(
            result.result_for("sub3").unwrap().outcome,
            DeliveryOutcome::Failed { status: Some(429), retry_after: Some(d), .. } if d == Duration::from_secs(30)
        ));
        assert!(matches!(
            result.result_for("sub5").unwrap().outcome,
            DeliveryOutcome::Delivered { status: 204 }
        ));

        let breakers = fx.manager.breakers();
        assert_eq!(breakers.get("peer1").await.unwrap().unwrap().failure_count, 1);
        assert_eq!(breakers.get("peer2").await.unwrap().unwrap().failure_count, 1);
        assert_eq!(breakers.get("peer3").await.unwrap().unwrap().failure_count, 1);
        // Refusals from a reachable peer do not count
        assert_eq!(breakers.get("peer4").await.unwrap().unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_peer_until_cooldown() {
        let config = FanOutConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            ..FanOutConfig::default()
        };
        let fx = fixture(config, MockTransport::new()).await;
        let url = "https://peer1.example/callbacks";
        fx.transport.respond(url, MockResponse::ConnectionRefused);

        for seq in 1..=2 {
            let result = fx.manager.deliver_to_subscribers(vec![delivery(1, seq)], &json!({}), &scope()).await;
            assert_eq!(result.failed, 1);
        }
        assert_eq!(fx.manager.breakers().state("peer1").await.unwrap(), CircuitState::Open);

        let result = fx
            .manager
            .deliver_to_subscribers(vec![delivery(1, 3), delivery(2, 1)], &json!({}), &scope())
            .await;
        assert_eq!((result.circuit_open, result.successful, result.failed), (1, 1, 0));
        assert_eq!(fx.transport.requests_to(url).len(), 2);

        // Cooldown over: one trial goes out and its success closes the breaker
        fx.clock.advance(Duration::from_secs(60));
        fx.transport.respond(url, MockResponse::Status(200));
        let result = fx.manager.deliver_to_subscribers(vec![delivery(1, 4)], &json!({}), &scope()).await;
        assert_eq!(result.successful, 1);
        assert_eq!(fx.manager.breakers().state("peer1").await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let config = FanOutConfig { max_concurrent: 2, ..FanOutConfig::default() };
        let fx = fixture(config, MockTransport::with_delay(Duration::from_millis(20))).await;

        let deliveries = (1..=5).map(|n| delivery(n, 1)).collect();
        let result = fx.manager.deliver_to_subscribers(deliveries, &json!({}), &scope()).await;

        assert_eq!(result.successful, 5);
        assert!(fx.transport.max_in_flight() <= 2);
        assert_eq!(fx.transport.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_capability_lookups_share_the_permit_budget() {
        let config = FanOutConfig {
            max_concurrent: 2,
            compression_threshold: 16,
            ..FanOutConfig::default()
        };
        let fetcher = StaticCapabilityFetcher::with_delay(Duration::from_millis(20));
        for n in 1..=5 {
            fetcher.set(&format!("https://peer{}.example", n), &[CALLBACK_COMPRESSION], None).await;
        }
        let fx = fixture_with(config, MockTransport::new(), fetcher).await;

        let big = json!({"text": "memory ".repeat(20)});
        let deliveries = (1..=5).map(|n| delivery(n, 1)).collect();
        let result = fx.manager.deliver_to_subscribers(deliveries, &big, &scope()).await;

        assert_eq!(result.successful, 5);
        assert!(result.results.iter().all(|r| r.compressed));
        assert_eq!(fx.fetcher.calls(), 5);
        assert!(fx.fetcher.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_capabilities_fetched_once_per_batch() {
        let config = FanOutConfig { compression_threshold: 16, ..FanOutConfig::default() };
        let fx = fixture(config, MockTransport::new()).await;
        fx.fetcher.fail("https://peer1.example").await;

        let big = json!({"text": "memory ".repeat(20)});
        let deliveries: Vec<Delivery> = (1..=10)
            .map(|n| {
                let mut d = delivery(1, n);
                d.subscription.subscription_id = format!("sub1-{}", n);
                d
            })
            .collect();
        let result = fx.manager.deliver_to_subscribers(deliveries.clone(), &big, &scope()).await;

        assert_eq!(result.successful, 10);
        assert!(result.results.iter().all(|r| !r.compressed));
        assert_eq!(fx.fetcher.calls(), 1);

        // The failure is remembered across batches too
        fx.manager.deliver_to_subscribers(deliveries, &big, &scope()).await;
        assert_eq!(fx.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let fx = fixture(FanOutConfig::default(), MockTransport::new()).await;
        let result = fx.manager.deliver_to_subscribers(Vec::new(), &json!({}), &scope()).await;
        assert_eq!(result, FanOutResult::default());
    }
}
