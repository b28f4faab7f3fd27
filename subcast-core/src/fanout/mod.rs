//! Publisher-side delivery
//!
//! [`FanOutManager`] pushes one change notification to every subscriber of a
//! scope concurrently, shielding healthy peers from unhealthy ones with a
//! per-peer [`CircuitBreakerRegistry`].

mod circuit_breaker;
mod compression;
mod manager;
mod transport;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use compression::{gunzip, gzip, GZIP_ENCODING};
pub use manager::{Delivery, DeliveryOutcome, FanOutManager, FanOutResult, SubscriberResult};
pub use transport::{
    parse_retry_after, CallbackTransport, HttpCallbackTransport, TransportError, TransportResponse,
};
