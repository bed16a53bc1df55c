//! Retry policy with exponential backoff.
//!
//! The policy only decides; the executor owns the loop and the sleeping.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::AttemptFailure;
use crate::timeout::secs_to_duration;
use crate::transport::TransportErrorKind;

/// Retry section of the client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds
    pub backoff_base: f64,
    /// Upper bound on any backoff delay, in seconds
    pub backoff_max: f64,
    /// Response statuses that are retried
    pub retryable_status_codes: BTreeSet<u16>,
    /// Transport failure kinds that are retried
    pub retryable_errors: BTreeSet<TransportErrorKind>,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 0.1,
            backoff_max: 10.0,
            retryable_status_codes: [429, 502, 503, 504].into_iter().collect(),
            retryable_errors: TransportErrorKind::TRANSIENT.into_iter().collect(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Set the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base backoff in seconds.
    #[must_use]
    pub const fn with_backoff_base(mut self, secs: f64) -> Self {
        self.backoff_base = secs;
        self
    }

    /// Set the maximum backoff in seconds.
    #[must_use]
    pub const fn with_backoff_max(mut self, secs: f64) -> Self {
        self.backoff_max = secs;
        self
    }

    /// Replace the retryable status set.
    #[must_use]
    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the retryable transport failure kinds.
    #[must_use]
    pub fn with_errors(mut self, kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.retryable_errors = kinds.into_iter().collect();
        self
    }

    /// Disable jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Validate the section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the attempt budget is zero, a delay is
    /// negative, the base exceeds the max, or a status code is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        RetryPolicy::from_config(self).map(|_| ())
    }
}

/// Why the policy refused another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The attempt budget is spent
    BudgetExhausted,
    /// The failure is not in the retryable sets
    NotRetryable,
    /// The request is not safe to replay (POST/PATCH without an idempotency key)
    NotReplaySafe,
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay
    Retry(Duration),
    /// Surface the failure
    Stop(StopReason),
}

/// Validated retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    retryable_status_codes: HashSet<u16>,
    retryable_errors: HashSet<TransportErrorKind>,
    jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the section is invalid.
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let backoff_base = secs_to_duration("retries.backoff_base", config.backoff_base)?;
        let backoff_max = secs_to_duration("retries.backoff_max", config.backoff_max)?;
        if backoff_base > backoff_max {
            return Err(ConfigError::InvalidRetry(
                "backoff_base must not exceed backoff_max".to_string(),
            ));
        }
        if let Some(code) = config
            .retryable_status_codes
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(ConfigError::InvalidRetry(format!(
                "{code} is not a valid HTTP status code"
            )));
        }

        Ok(Self {
            max_attempts: config.max_attempts,
            backoff_base,
            backoff_max,
            retryable_status_codes: config.retryable_status_codes.iter().copied().collect(),
            retryable_errors: config.retryable_errors.iter().copied().collect(),
            jitter: config.jitter,
        })
    }

    /// A single-attempt policy that treats nothing as retryable.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            retryable_status_codes: HashSet::new(),
            retryable_errors: HashSet::new(),
            jitter: false,
        }
    }

    /// Get the attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a response status is in the retryable set.
    #[must_use]
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Whether a transport failure kind is in the retryable set.
    #[must_use]
    pub fn is_retryable_error(&self, kind: TransportErrorKind) -> bool {
        self.retryable_errors.contains(&kind)
    }

    /// Whether a failure is retryable under this policy.
    #[must_use]
    pub fn is_retryable(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Transport(err) => self.is_retryable_error(err.kind()),
            AttemptFailure::Status { status, .. } => self.is_retryable_status(*status),
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-based: the delay after the first attempt is `backoff_base`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }

    /// Backoff before attempt `attempt + 1`, with jitter in `[0, delay)` when enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..delay.as_secs_f64());
        delay.saturating_add(Duration::from_secs_f64(spread))
    }

    /// Decide whether to issue another attempt after `attempt` failed.
    ///
    /// `replay_safe` is false for POST and PATCH requests that carry no
    /// idempotency key.
    #[must_use]
    pub fn should_retry(
        &self,
        attempt: u32,
        failure: &AttemptFailure,
        replay_safe: bool,
    ) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::Stop(StopReason::BudgetExhausted);
        }
        if !self.is_retryable(failure) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if !replay_safe {
            return RetryDecision::Stop(StopReason::NotReplaySafe);
        }

        let mut delay = self.delay_for_attempt(attempt);
        if let AttemptFailure::Status {
            retry_after: Some(requested),
            ..
        } = failure
        {
            delay = delay.max((*requested).min(self.backoff_max));
        }
        RetryDecision::Retry(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default()).unwrap_or_else(|_| Self::disabled())
    }
}

/// Whether repeating `method` cannot multiply its side effects.
#[must_use]
pub fn is_idempotent_method(method: &Method) -> bool {
    !matches!(*method, Method::POST | Method::PATCH)
}
