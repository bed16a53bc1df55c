//! Client configuration with eager validation.
//!
//! Every section is optional; an absent section disables that feature (or,
//! for timeouts, defers to the transport defaults). Unknown fields are
//! rejected at load time rather than ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::idempotency::IdempotencyConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use crate::tracing_config::TracingConfig;

/// Environment variable prefix read by [`ClientConfig::from_env`].
pub const ENV_PREFIX: &str = "HTTP_INTEGRATOR";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Negative or non-finite duration
    #[error("Invalid timeout for {field}: {value} (must be a finite number >= 0)")]
    InvalidTimeout {
        /// Offending field
        field: &'static str,
        /// Rejected value in seconds
        value: f64,
    },

    /// Invalid retry section
    #[error("Invalid retry configuration: {0}")]
    InvalidRetry(String),

    /// Invalid circuit breaker section
    #[error("Invalid circuit breaker configuration: {0}")]
    InvalidCircuitBreaker(String),

    /// Invalid rate limit section
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),

    /// Invalid idempotency section
    #[error("Invalid idempotency configuration: {0}")]
    InvalidIdempotency(String),

    /// Tracing filter directives do not parse
    #[error("Invalid tracing configuration: {0}")]
    InvalidTracing(String),

    /// Base URL cannot be parsed or cannot serve as a base
    #[error("Invalid base URL {url}: {reason}")]
    InvalidBaseUrl {
        /// The rejected URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// Configuration source could not be read or parsed (includes unknown fields)
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// The HTTP transport could not be built
    #[error("Failed to build transport: {0}")]
    Transport(String),

    /// The blocking client's runtime could not be started
    #[error("Failed to start runtime: {0}")]
    Runtime(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load(err.to_string())
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Timeout policy
    #[serde(default)]
    pub timeouts: Option<TimeoutConfig>,
    /// Retry policy; absent means a single attempt
    #[serde(default)]
    pub retries: Option<RetryConfig>,
    /// Per-endpoint circuit breaker
    #[serde(default, alias = "circuitBreaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Per-endpoint rate limiter
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Idempotency key deduplication
    #[serde(default)]
    pub idempotency: Option<IdempotencyConfig>,
    /// Subscriber options for [`init_tracing`](crate::init_tracing); the
    /// client never installs a subscriber itself
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

impl ClientConfig {
    /// Set the timeout section.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Set the retry section.
    #[must_use]
    pub fn with_retries(mut self, retries: RetryConfig) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the circuit breaker section.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Set the rate limit section.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Set the idempotency section.
    #[must_use]
    pub fn with_idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    /// Set the tracing section.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Validate every present section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(timeouts) = &self.timeouts {
            timeouts.to_policy()?;
        }
        if let Some(retries) = &self.retries {
            retries.validate()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.validate()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(idempotency) = &self.idempotency {
            idempotency.validate()?;
        }
        if let Some(tracing) = &self.tracing {
            tracing.validate()?;
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] for malformed JSON or unknown fields, or
    /// the validation error for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML, YAML or JSON file, chosen by extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate from `HTTP_INTEGRATOR__*` environment variables.
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Nested keys use `__`, e.g. `HTTP_INTEGRATOR__TIMEOUTS__CONNECT=2.5`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
