//! Per-endpoint token bucket rate limiter.
//!
//! Buckets start full and refill continuously, so fractional rates such as
//! one call every four seconds work without a fixed window.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ConfigError;
use crate::keyed::KeyedStore;
use crate::timeout::{saturating_secs, secs_to_duration};

/// Rate limit section of the client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Bucket capacity, i.e. the largest burst admitted at once
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Longest a call will wait for a token before failing, in seconds
    pub max_wait: f64,
    /// Maximum number of endpoints tracked before LRU eviction
    pub max_endpoints: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10.0,
            max_wait: 1.0,
            max_endpoints: 1024,
        }
    }
}

impl RateLimitConfig {
    /// Set capacity and refill rate.
    #[must_use]
    pub const fn with_rate(mut self, capacity: u32, refill_rate: f64) -> Self {
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self
    }

    /// Set the maximum wait in seconds.
    #[must_use]
    pub const fn with_max_wait(mut self, secs: f64) -> Self {
        self.max_wait = secs;
        self
    }

    /// Validate the section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero capacity, a non-positive refill rate
    /// or a negative wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "capacity must be at least 1".to_string(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(
                "refill_rate must be greater than 0".to_string(),
            ));
        }
        if self.max_endpoints == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "max_endpoints must be at least 1".to_string(),
            ));
        }
        secs_to_duration("rate_limit.max_wait", self.max_wait)?;
        Ok(())
    }
}

/// Rate limit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request allowed
    Allowed,
    /// Request denied with retry-after duration
    Denied {
        /// Time until one token is available
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the call may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Current bucket level for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitInfo {
    /// Whole tokens currently available
    pub remaining: u32,
    /// Bucket capacity
    pub capacity: u32,
    /// Time until the bucket is full again
    pub reset_after: Duration,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket limiter keyed by endpoint.
pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    max_wait: Duration,
    buckets: KeyedStore<TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the section is invalid.
    pub fn new(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            max_wait: secs_to_duration("rate_limit.max_wait", config.max_wait)?,
            buckets: KeyedStore::new(config.max_endpoints),
        })
    }

    /// Longest a call should wait for a token.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Try to take one token for `endpoint`.
    pub fn acquire(&self, endpoint: &str) -> RateLimitDecision {
        self.acquire_at(endpoint, Instant::now())
    }

    /// Try to take one token for `endpoint` as of `now`.
    ///
    /// Refill and decision happen in one exclusive section per endpoint.
    pub fn acquire_at(&self, endpoint: &str, now: Instant) -> RateLimitDecision {
        let capacity = f64::from(self.capacity);
        let rate = self.refill_rate;

        let decision = self.buckets.with(
            endpoint,
            || TokenBucket {
                tokens: capacity,
                last_refill: now,
            },
            |bucket| {
                bucket.refill(now, capacity, rate);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    RateLimitDecision::Allowed
                } else {
                    RateLimitDecision::Denied {
                        retry_after: saturating_secs((1.0 - bucket.tokens) / rate),
                    }
                }
            },
        );

        if let RateLimitDecision::Denied { retry_after } = decision {
            debug!(
                endpoint = %endpoint,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// Bucket level for `endpoint`, if it has been seen.
    #[must_use]
    pub fn limit_info(&self, endpoint: &str) -> Option<RateLimitInfo> {
        let capacity = f64::from(self.capacity);
        let rate = self.refill_rate;
        let now = Instant::now();

        self.buckets.peek(endpoint, |bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
            let tokens = (bucket.tokens + elapsed * rate).min(capacity);
            RateLimitInfo {
                remaining: tokens.floor() as u32,
                capacity: self.capacity,
                reset_after: saturating_secs((capacity - tokens) / rate),
            }
        })
    }

    /// Forget the bucket for `endpoint`, refilling it.
    pub fn reset(&self, endpoint: &str) {
        self.buckets.remove(endpoint);
    }

    /// Number of endpoints currently tracked.
    #[must_use]
    pub fn tracked_endpoints(&self) -> usize {
        self.buckets.len()
    }
}
