//! Test fixtures with sample data.

use http_integrator::{
    CircuitBreakerConfig, ClientConfig, IdempotencyConfig, RateLimitConfig, RetryConfig,
    TimeoutConfig,
};
use serde::{Deserialize, Serialize};

/// A configuration document that sets every section.
pub const FULL_CONFIG_JSON: &str = r#"{
    "timeouts": {"connect": 2.0, "read": 10.0, "write": 5.0, "pool": 1.0},
    "retries": {
        "max_attempts": 4,
        "backoff_base": 0.05,
        "backoff_max": 2.0,
        "retryable_status_codes": [429, 503],
        "retryable_errors": ["connect", "read_timeout"],
        "jitter": false
    },
    "circuit_breaker": {"failure_threshold": 3, "window": 5.0, "cooldown": 15.0},
    "rate_limit": {"capacity": 20, "refill_rate": 5.0, "max_wait": 0.5},
    "idempotency": {"header_name": "Idempotency-Key", "ttl": 600.0, "auto_generate": true}
}"#;

/// Retries for 503 only, with a fixed 100ms base and no jitter.
#[must_use]
pub fn fast_retry_config(max_attempts: u32) -> ClientConfig {
    ClientConfig::default().with_retries(
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff_base(0.1)
            .with_status_codes([503])
            .without_jitter(),
    )
}

/// Circuit breaking with `threshold` failures in 10s and a 30s cooldown.
#[must_use]
pub fn circuit_config(threshold: u32) -> ClientConfig {
    ClientConfig::default().with_circuit_breaker(
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_window(10.0)
            .with_cooldown(30.0),
    )
}

/// Rate limiting with `capacity` tokens, a slow refill and no waiting.
#[must_use]
pub fn strict_rate_limit_config(capacity: u32) -> ClientConfig {
    ClientConfig::default().with_rate_limit(
        RateLimitConfig::default()
            .with_rate(capacity, 0.1)
            .with_max_wait(0.0),
    )
}

/// Idempotency with retries on 503 and default timeouts.
#[must_use]
pub fn idempotent_config() -> ClientConfig {
    fast_retry_config(3)
        .with_timeouts(TimeoutConfig::default())
        .with_idempotency(IdempotencyConfig::default())
}

/// Sample order payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleOrder {
    /// Order identifier
    pub id: String,
    /// Amount in cents
    pub amount: u64,
    /// ISO currency code
    pub currency: String,
}

impl SampleOrder {
    /// A sample order.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            amount: 1_250,
            currency: "EUR".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let config = ClientConfig::from_json_str(FULL_CONFIG_JSON).unwrap();
        assert_eq!(config.retries.unwrap().max_attempts, 4);
        assert!(config.idempotency.unwrap().auto_generate);
    }

    #[test]
    fn test_fixtures_are_valid() {
        assert!(fast_retry_config(3).validate().is_ok());
        assert!(circuit_config(5).validate().is_ok());
        assert!(strict_rate_limit_config(2).validate().is_ok());
        assert!(idempotent_config().validate().is_ok());
    }
}
