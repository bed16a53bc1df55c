//! Error types for resilient HTTP calls.
//!
//! Every failure a logical call can surface is a variant of [`IntegratorError`],
//! classified as retryable or not so callers can decide what to do next.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Result type for client operations.
pub type IntegratorResult<T> = Result<T, IntegratorError>;

/// Why a call stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Token,
    /// The caller-supplied deadline passed.
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => write!(f, "cancellation requested"),
            Self::Deadline => write!(f, "deadline exceeded"),
        }
    }
}

/// The failure observed on the last attempt of a logical call.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// The transport could not complete the exchange.
    Transport(TransportError),
    /// The server answered with a status the retry policy treats as transient.
    Status {
        /// Response status
        status: StatusCode,
        /// Delay requested by a `Retry-After` header, if any
        retry_after: Option<Duration>,
    },
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Status { status, .. } => write!(f, "server responded with {status}"),
        }
    }
}

/// Errors surfaced by [`Client`](crate::Client) calls.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IntegratorError {
    /// Invalid configuration, detected at construction or on a per-call override
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport failure that the retry policy did not absorb
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Circuit breaker is open for the endpoint; no network call was made
    #[error("Circuit breaker open for {endpoint}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Endpoint key whose circuit is open
        endpoint: String,
        /// Time until the circuit admits a trial call
        retry_after: Duration,
    },

    /// Rate limiter denied the call and the wait would exceed the call budget
    #[error("Rate limited on {endpoint}, retry after {retry_after:?}")]
    RateLimited {
        /// Endpoint key that is being throttled
        endpoint: String,
        /// Time until a token becomes available
        retry_after: Duration,
    },

    /// The idempotency key was reused with a different request
    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyConflict {
        /// The conflicting key
        key: String,
    },

    /// Another call holding the same idempotency key did not finish within the call budget
    #[error("Idempotency key {key} is still in flight")]
    IdempotencyInFlight {
        /// The contended key
        key: String,
    },

    /// Every allowed attempt failed
    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        /// Number of attempts issued
        attempts: u32,
        /// Failure observed on the final attempt
        last: AttemptFailure,
    },

    /// The caller cancelled the call or its deadline passed
    #[error("Call cancelled: {0}")]
    Cancelled(CancelReason),

    /// Request URL could not be parsed or joined with the base URL
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// Request header name or value is malformed
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Request body could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntegratorError {
    /// Check if the caller may reasonably retry this call later.
    ///
    /// # Examples
    ///
    /// ```
    /// use http_integrator::IntegratorError;
    /// use std::time::Duration;
    ///
    /// let err = IntegratorError::circuit_open("api.example.com/users", Duration::from_secs(5));
    /// assert!(err.is_retryable());
    ///
    /// let err = IntegratorError::IdempotencyConflict { key: "k1".to_string() };
    /// assert!(!err.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::IdempotencyInFlight { .. }
                | Self::RetryBudgetExhausted { .. }
        )
    }

    /// Suggested delay before retrying, when the error carries one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Create a circuit open error for the given endpoint.
    #[must_use]
    pub fn circuit_open(endpoint: impl Into<String>, retry_after: Duration) -> Self {
        Self::CircuitOpen {
            endpoint: endpoint.into(),
            retry_after,
        }
    }

    /// Create a rate limited error for the given endpoint.
    #[must_use]
    pub fn rate_limited(endpoint: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            endpoint: endpoint.into(),
            retry_after,
        }
    }

    /// Create an invalid URL error.
    #[must_use]
    pub fn invalid_url(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
