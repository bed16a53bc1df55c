//! Timeout policy and per-call resolution.
//!
//! A client carries one immutable [`TimeoutPolicy`]. Each call may pass a
//! [`TimeoutOverride`]; [`resolve`] merges the two dimension by dimension and
//! falls back to [`TransportDefaults`] for anything left unset.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ConfigError;

/// Timeout section of the client configuration, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect")]
    pub connect: f64,
    /// Read timeout in seconds
    #[serde(default = "default_read")]
    pub read: f64,
    /// Write timeout in seconds
    #[serde(default)]
    pub write: Option<f64>,
    /// Pool acquisition timeout in seconds
    #[serde(default)]
    pub pool: Option<f64>,
}

const fn default_connect() -> f64 {
    5.0
}

const fn default_read() -> f64 {
    30.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            read: default_read(),
            write: None,
            pool: None,
        }
    }
}

impl TimeoutConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect(mut self, secs: f64) -> Self {
        self.connect = secs;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub const fn with_read(mut self, secs: f64) -> Self {
        self.read = secs;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub const fn with_write(mut self, secs: f64) -> Self {
        self.write = Some(secs);
        self
    }

    /// Set the pool timeout.
    #[must_use]
    pub const fn with_pool(mut self, secs: f64) -> Self {
        self.pool = Some(secs);
        self
    }

    /// Validate and convert into a [`TimeoutPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTimeout`] for negative or non-finite values.
    pub fn to_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        Ok(TimeoutPolicy {
            connect: Some(secs_to_duration("connect", self.connect)?),
            read: Some(secs_to_duration("read", self.read)?),
            write: opt_secs("write", self.write)?,
            pool: opt_secs("pool", self.pool)?,
        })
    }
}

/// Validated client-level timeouts. `None` defers to the transport default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    connect: Option<Duration>,
    read: Option<Duration>,
    write: Option<Duration>,
    pool: Option<Duration>,
}

impl TimeoutPolicy {
    /// A policy with every dimension unset.
    #[must_use]
    pub const fn unset() -> Self {
        Self {
            connect: None,
            read: None,
            write: None,
            pool: None,
        }
    }

    /// Create a policy from already-validated durations.
    #[must_use]
    pub const fn new(
        connect: Option<Duration>,
        read: Option<Duration>,
        write: Option<Duration>,
        pool: Option<Duration>,
    ) -> Self {
        Self {
            connect,
            read,
            write,
            pool,
        }
    }

    /// Connect timeout, if set.
    #[must_use]
    pub const fn connect(&self) -> Option<Duration> {
        self.connect
    }

    /// Read timeout, if set.
    #[must_use]
    pub const fn read(&self) -> Option<Duration> {
        self.read
    }

    /// Write timeout, if set.
    #[must_use]
    pub const fn write(&self) -> Option<Duration> {
        self.write
    }

    /// Pool timeout, if set.
    #[must_use]
    pub const fn pool(&self) -> Option<Duration> {
        self.pool
    }
}

/// Per-call timeout override in seconds. Unset fields keep the client policy.
///
/// With [`ReqwestTransport`](crate::ReqwestTransport) the dial timeout is fixed
/// when the client is built, so a per-call connect value only widens or
/// narrows the whole-call bound from [`EffectiveTimeout::call_budget`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeoutOverride {
    /// Connect timeout in seconds
    pub connect: Option<f64>,
    /// Read timeout in seconds
    pub read: Option<f64>,
    /// Write timeout in seconds
    pub write: Option<f64>,
    /// Pool timeout in seconds
    pub pool: Option<f64>,
}

impl TimeoutOverride {
    /// Override every dimension with the same value.
    #[must_use]
    pub const fn all(secs: f64) -> Self {
        Self {
            connect: Some(secs),
            read: Some(secs),
            write: Some(secs),
            pool: Some(secs),
        }
    }

    /// Override the connect timeout.
    ///
    /// Custom transports see it in [`EffectiveTimeout::connect`]. The reqwest
    /// transport keeps its build-time dial timeout and applies this value only
    /// through [`EffectiveTimeout::call_budget`].
    #[must_use]
    pub const fn with_connect(mut self, secs: f64) -> Self {
        self.connect = Some(secs);
        self
    }

    /// Override the read timeout.
    #[must_use]
    pub const fn with_read(mut self, secs: f64) -> Self {
        self.read = Some(secs);
        self
    }

    /// Override the write timeout.
    #[must_use]
    pub const fn with_write(mut self, secs: f64) -> Self {
        self.write = Some(secs);
        self
    }

    /// Override the pool timeout.
    ///
    /// Passed to custom transports as [`EffectiveTimeout::pool`]; the reqwest
    /// transport ignores it and does not count it in the call budget.
    #[must_use]
    pub const fn with_pool(mut self, secs: f64) -> Self {
        self.pool = Some(secs);
        self
    }
}

/// Fallback values used when neither the policy nor the override sets a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportDefaults {
    /// Default connect timeout
    pub connect: Duration,
    /// Default read timeout
    pub read: Duration,
    /// Default write timeout
    pub write: Duration,
    /// Default pool timeout
    pub pool: Duration,
}

impl Default for TransportDefaults {
    fn default() -> Self {
        let five = Duration::from_secs(5);
        Self {
            connect: five,
            read: five,
            write: five,
            pool: five,
        }
    }
}

/// Fully resolved timeouts for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveTimeout {
    /// Connect timeout
    pub connect: Duration,
    /// Read timeout
    pub read: Duration,
    /// Write timeout
    pub write: Duration,
    /// Pool timeout
    pub pool: Duration,
}

impl EffectiveTimeout {
    /// Upper bound for one exchange: dial, send and receive.
    ///
    /// Also bounds how long a call may wait on the rate limiter or on another
    /// call holding the same idempotency key.
    #[must_use]
    pub fn call_budget(&self) -> Duration {
        self.connect
            .saturating_add(self.write)
            .saturating_add(self.read)
    }
}

/// Merge a client policy with a per-call override using the default fallbacks.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeout`] if the override holds a negative or
/// non-finite value.
pub fn resolve(
    base: &TimeoutPolicy,
    override_: Option<&TimeoutOverride>,
) -> Result<EffectiveTimeout, ConfigError> {
    resolve_with(base, override_, &TransportDefaults::default())
}

/// Merge a client policy with a per-call override using explicit fallbacks.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeout`] if the override holds a negative or
/// non-finite value.
pub fn resolve_with(
    base: &TimeoutPolicy,
    override_: Option<&TimeoutOverride>,
    defaults: &TransportDefaults,
) -> Result<EffectiveTimeout, ConfigError> {
    let over = override_.copied().unwrap_or_default();
    Ok(EffectiveTimeout {
        connect: opt_secs("connect", over.connect)?
            .or(base.connect)
            .unwrap_or(defaults.connect),
        read: opt_secs("read", over.read)?
            .or(base.read)
            .unwrap_or(defaults.read),
        write: opt_secs("write", over.write)?
            .or(base.write)
            .unwrap_or(defaults.write),
        pool: opt_secs("pool", over.pool)?
            .or(base.pool)
            .unwrap_or(defaults.pool),
    })
}

/// Convert seconds to a duration, rejecting negative, non-finite and
/// unrepresentably large input.
pub(crate) fn secs_to_duration(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    let invalid = ConfigError::InvalidTimeout { field, value: secs };
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid);
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid)
}

/// Seconds to a duration for computed waits, saturating instead of failing.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Stand-in for instants too far away to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, capped at a far-future instant.
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now + after.min(FAR_FUTURE)
}

fn opt_secs(field: &'static str, secs: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    secs.map(|s| secs_to_duration(field, s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert!((config.connect - 5.0).abs() < f64::EPSILON);
        assert!((config.read - 30.0).abs() < f64::EPSILON);
        assert!(config.write.is_none());
        assert!(config.pool.is_none());
    }

    #[test]
    fn test_timeout_config_rejects_negative() {
        let config = TimeoutConfig::default().with_connect(-1.0);
        assert!(matches!(
            config.to_policy(),
            Err(ConfigError::InvalidTimeout { field: "connect", .. })
        ));

        let config = TimeoutConfig::default().with_read(-1.0);
        assert!(matches!(
            config.to_policy(),
            Err(ConfigError::InvalidTimeout { field: "read", .. })
        ));
    }

    #[test]
    fn test_timeout_config_accepts_zero() {
        let policy = TimeoutConfig::default()
            .with_connect(0.0)
            .with_read(0.0)
            .to_policy()
            .unwrap();
        assert_eq!(policy.connect(), Some(Duration::ZERO));
        assert_eq!(policy.read(), Some(Duration::ZERO));
    }

    #[test]
    fn test_optional_fields_defer_to_transport() {
        let policy = TimeoutConfig::default().to_policy().unwrap();
        let effective = resolve(&policy, None).unwrap();
        assert_eq!(effective.connect, Duration::from_secs(5));
        assert_eq!(effective.read, Duration::from_secs(30));
        assert_eq!(effective.write, TransportDefaults::default().write);
        assert_eq!(effective.pool, TransportDefaults::default().pool);
    }

    #[test]
    fn test_override_wins_per_dimension() {
        let policy = TimeoutConfig::default()
            .with_write(10.0)
            .with_pool(20.0)
            .to_policy()
            .unwrap();
        let over = TimeoutOverride::default().with_connect(2.0).with_read(10.0);
        let effective = resolve(&policy, Some(&over)).unwrap();

        assert_eq!(effective.connect, Duration::from_secs(2));
        assert_eq!(effective.read, Duration::from_secs(10));
        assert_eq!(effective.write, Duration::from_secs(10));
        assert_eq!(effective.pool, Duration::from_secs(20));
    }

    #[test]
    fn test_override_rejects_negative_and_nan() {
        let policy = TimeoutPolicy::unset();
        let over = TimeoutOverride::default().with_read(-0.5);
        assert!(resolve(&policy, Some(&over)).is_err());

        let over = TimeoutOverride::default().with_pool(f64::NAN);
        assert!(resolve(&policy, Some(&over)).is_err());
    }

    #[test]
    fn test_huge_values_are_rejected_not_panicking() {
        assert!(matches!(
            TimeoutConfig::default().with_read(1e20).to_policy(),
            Err(ConfigError::InvalidTimeout { field: "read", .. })
        ));

        let over = TimeoutOverride::default().with_connect(f64::MAX);
        assert!(matches!(
            resolve(&TimeoutPolicy::unset(), Some(&over)),
            Err(ConfigError::InvalidTimeout { field: "connect", .. })
        ));
    }

    #[test]
    fn test_saturating_secs() {
        assert_eq!(saturating_secs(1e300), Duration::MAX);
        assert_eq!(saturating_secs(-1.0), Duration::ZERO);
        assert_eq!(saturating_secs(f64::NAN), Duration::ZERO);
        assert_eq!(saturating_secs(0.25), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_caps_far_instants() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(1)), now + Duration::from_secs(1));
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[test]
    fn test_resolve_does_not_mutate_policy() {
        let policy = TimeoutConfig::default().to_policy().unwrap();
        let before = policy;
        let _ = resolve(&policy, Some(&TimeoutOverride::all(1.0))).unwrap();
        assert_eq!(policy, before);
    }

    #[test]
    fn test_call_budget() {
        let effective = EffectiveTimeout {
            connect: Duration::from_secs(1),
            read: Duration::from_secs(3),
            write: Duration::from_secs(2),
            pool: Duration::from_secs(9),
        };
        assert_eq!(effective.call_budget(), Duration::from_secs(6));
    }

    #[test]
    fn test_connect_override_reaches_call_budget_but_pool_does_not() {
        let policy = TimeoutConfig::default().with_write(1.0).to_policy().unwrap();
        let base = resolve(&policy, None).unwrap().call_budget();

        let widened = resolve(&policy, Some(&TimeoutOverride::default().with_connect(20.0)))
            .unwrap()
            .call_budget();
        assert_eq!(widened, base + Duration::from_secs(15));

        let pooled = resolve(&policy, Some(&TimeoutOverride::default().with_pool(60.0))).unwrap();
        assert_eq!(pooled.pool, Duration::from_secs(60));
        assert_eq!(pooled.call_budget(), base);
    }
}
