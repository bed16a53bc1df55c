//! Resilient HTTP client core.
//!
//! This crate wraps an HTTP transport (reqwest by default) with:
//! - Per-call timeout resolution over a client-wide policy
//! - Retries with exponential backoff and jitter
//! - Per-endpoint circuit breaking
//! - Per-endpoint token bucket rate limiting
//! - Idempotency-key deduplication for mutating calls
//! - Prometheus-style counters and tracing integration
//!
//! ```no_run
//! use http_integrator::{Client, ClientConfig, RequestOptions, RetryConfig, TimeoutConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::default()
//!     .with_timeouts(TimeoutConfig::default().with_read(10.0))
//!     .with_retries(RetryConfig::default());
//! let client = Client::builder()
//!     .config(config)
//!     .base_url("https://api.example.com")
//!     .build()?;
//!
//! let response = client.get("/users/7", RequestOptions::new()).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocking;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;
pub mod tracing_config;
pub mod transport;

mod call;
mod keyed;

pub use blocking::BlockingClient;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState};
pub use client::{Client, ClientBuilder, RequestOptions};
pub use config::{ClientConfig, ConfigError};
pub use error::{AttemptFailure, CancelReason, IntegratorError, IntegratorResult};
pub use executor::endpoint_key;
pub use idempotency::{IdempotencyConfig, IdempotencyManager, RecordState};
pub use metrics::ClientMetrics;
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy, StopReason};
pub use timeout::{EffectiveTimeout, TimeoutConfig, TimeoutOverride, TimeoutPolicy, resolve};
pub use tracing_config::{TracingConfig, init_tracing};
pub use transport::{
    ReqwestTransport, Response, Transport, TransportConfig, TransportError, TransportErrorKind,
    TransportRequest,
};
