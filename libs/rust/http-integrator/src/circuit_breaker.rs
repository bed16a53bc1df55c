//! Per-endpoint circuit breaker.
//!
//! Each endpoint key has its own state machine with three states:
//! - Closed: calls pass; failures inside the rolling window are counted
//! - Open: calls fail fast until the cooldown elapses
//! - Half-Open: exactly one trial call decides between Closed and Open
//!
//! All state changes go through [`CircuitBreakerState::transition`], which runs
//! inside the endpoint's own exclusive section.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::keyed::KeyedStore;
use crate::timeout::{deadline_after, saturating_secs, secs_to_duration};

/// Circuit breaker section of the client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,
    /// Rolling failure window, in seconds
    pub window: f64,
    /// Time the circuit stays open before a trial call, in seconds
    pub cooldown: f64,
    /// Factor applied to the cooldown when a trial fails (1.0 keeps it constant)
    pub cooldown_multiplier: f64,
    /// Upper bound on the cooldown, in seconds
    pub max_cooldown: f64,
    /// Maximum number of endpoints tracked before LRU eviction
    pub max_endpoints: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: 10.0,
            cooldown: 30.0,
            cooldown_multiplier: 1.0,
            max_cooldown: 300.0,
            max_endpoints: 1024,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the failure window in seconds.
    #[must_use]
    pub const fn with_window(mut self, secs: f64) -> Self {
        self.window = secs;
        self
    }

    /// Set the cooldown in seconds.
    #[must_use]
    pub const fn with_cooldown(mut self, secs: f64) -> Self {
        self.cooldown = secs;
        self
    }

    /// Grow the cooldown by `multiplier` after each failed trial, up to `max_secs`.
    #[must_use]
    pub const fn with_cooldown_backoff(mut self, multiplier: f64, max_secs: f64) -> Self {
        self.cooldown_multiplier = multiplier;
        self.max_cooldown = max_secs;
        self
    }

    /// Validate the section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero threshold, an empty window, a
    /// shrinking multiplier or a cooldown above its cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        CircuitSettings::from_config(self).map(|_| ())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, one trial request is allowed
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct CircuitSettings {
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    cooldown_multiplier: f64,
    max_cooldown: Duration,
}

impl CircuitSettings {
    fn from_config(config: &CircuitBreakerConfig) -> Result<Self, ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidCircuitBreaker(msg.to_string()));
        if config.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1");
        }
        if config.max_endpoints == 0 {
            return invalid("max_endpoints must be at least 1");
        }
        if !config.cooldown_multiplier.is_finite() || config.cooldown_multiplier < 1.0 {
            return invalid("cooldown_multiplier must be at least 1.0");
        }
        let window = secs_to_duration("circuit_breaker.window", config.window)?;
        if window.is_zero() {
            return invalid("window must be greater than 0");
        }
        let cooldown = secs_to_duration("circuit_breaker.cooldown", config.cooldown)?;
        let max_cooldown = secs_to_duration("circuit_breaker.max_cooldown", config.max_cooldown)?;
        if cooldown > max_cooldown {
            return invalid("cooldown must not exceed max_cooldown");
        }

        Ok(Self {
            failure_threshold: config.failure_threshold,
            window,
            cooldown,
            cooldown_multiplier: config.cooldown_multiplier,
            max_cooldown,
        })
    }
}

/// Input to the circuit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitEvent {
    /// A call asks to pass
    Admit,
    /// An ordinary call succeeded
    Success,
    /// An ordinary call failed
    Failure,
    /// The half-open trial succeeded
    TrialSuccess,
    /// The half-open trial failed
    TrialFailure,
    /// The trial call ended without a verdict
    AbandonTrial,
}

/// Result of an [`CircuitEvent::Admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Allowed,
    Trial,
    Rejected { retry_after: Duration },
    /// Not an admission event
    Recorded,
}

/// Internal state for one endpoint.
#[derive(Debug, Clone)]
pub(crate) struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_start: Instant,
    last_transition: Instant,
    open_until: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped each time the circuit opens
    generation: u64,
}

impl CircuitBreakerState {
    fn new(now: Instant, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_start: now,
            last_transition: now,
            open_until: None,
            current_cooldown: cooldown,
            trial_in_flight: false,
            generation: 0,
        }
    }

    /// The single mutation point for endpoint state.
    fn transition(
        &mut self,
        event: CircuitEvent,
        now: Instant,
        settings: &CircuitSettings,
        name: &str,
    ) -> Admission {
        match (self.state, event) {
            (CircuitState::Closed, CircuitEvent::Admit) => Admission::Allowed,
            (CircuitState::Open, CircuitEvent::Admit) => {
                let open_until = self.open_until.unwrap_or(now);
                if now >= open_until {
                    self.state = CircuitState::HalfOpen;
                    self.last_transition = now;
                    self.trial_in_flight = true;
                    info!(circuit = %name, "Circuit transitioning to half-open");
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_after: open_until - now,
                    }
                }
            }
            (CircuitState::HalfOpen, CircuitEvent::Admit) => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
            (CircuitState::Closed, CircuitEvent::Success) => {
                self.failure_count = 0;
                self.success_count = self.success_count.saturating_add(1);
                Admission::Recorded
            }
            (CircuitState::HalfOpen, CircuitEvent::TrialSuccess) => {
                self.state = CircuitState::Closed;
                self.last_transition = now;
                self.failure_count = 0;
                self.success_count = 0;
                self.window_start = now;
                self.open_until = None;
                self.current_cooldown = settings.cooldown;
                self.trial_in_flight = false;
                info!(circuit = %name, "Circuit closed after recovery");
                Admission::Recorded
            }
            (CircuitState::Closed, CircuitEvent::Failure) => {
                if self.failure_count == 0 || now.duration_since(self.window_start) >= settings.window
                {
                    self.window_start = now;
                    self.failure_count = 0;
                }
                self.failure_count += 1;
                self.success_count = 0;
                if self.failure_count >= settings.failure_threshold {
                    self.open(now);
                    warn!(
                        circuit = %name,
                        failures = self.failure_count,
                        cooldown_ms = self.current_cooldown.as_millis() as u64,
                        "Circuit opened due to failures"
                    );
                }
                Admission::Recorded
            }
            (CircuitState::HalfOpen, CircuitEvent::TrialFailure) => {
                self.current_cooldown = saturating_secs(
                    self.current_cooldown.as_secs_f64() * settings.cooldown_multiplier,
                )
                .min(settings.max_cooldown);
                self.open(now);
                warn!(
                    circuit = %name,
                    cooldown_ms = self.current_cooldown.as_millis() as u64,
                    "Circuit re-opened from half-open"
                );
                Admission::Recorded
            }
            (CircuitState::HalfOpen, CircuitEvent::AbandonTrial) => {
                self.trial_in_flight = false;
                Admission::Recorded
            }
            // Only the trial decides a half-open circuit, and an open one
            // ignores everything but admission.
            (
                CircuitState::Open | CircuitState::HalfOpen,
                CircuitEvent::Success | CircuitEvent::Failure,
            )
            | (
                CircuitState::Closed | CircuitState::Open,
                CircuitEvent::TrialSuccess | CircuitEvent::TrialFailure | CircuitEvent::AbandonTrial,
            ) => Admission::Recorded,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_transition = now;
        self.open_until = Some(deadline_after(now, self.current_cooldown));
        self.success_count = 0;
        self.trial_in_flight = false;
        self.generation = self.generation.wrapping_add(1);
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_transition: self.last_transition,
            open_until: self.open_until,
        }
    }
}

/// Point-in-time view of one endpoint's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Failures counted in the current window
    pub failure_count: u32,
    /// Successes since the last failure
    pub success_count: u32,
    /// When the state last changed
    pub last_transition: Instant,
    /// When an open circuit admits its trial
    pub open_until: Option<Instant>,
}

/// Circuit breakers for every endpoint a client talks to.
pub struct CircuitBreaker {
    settings: CircuitSettings,
    circuits: KeyedStore<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Create a circuit breaker from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the section is invalid.
    pub fn new(config: &CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: CircuitSettings::from_config(config)?,
            circuits: KeyedStore::new(config.max_endpoints),
        })
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            settings: CircuitSettings {
                failure_threshold: config.failure_threshold,
                window: Duration::from_secs(10),
                cooldown: Duration::from_secs(30),
                cooldown_multiplier: config.cooldown_multiplier,
                max_cooldown: Duration::from_secs(300),
            },
            circuits: KeyedStore::new(config.max_endpoints),
        }
    }

    /// Ask to send a call to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns the time until the circuit admits a trial when it is open, or
    /// when another trial is already in flight.
    pub fn admit(&self, endpoint: &str) -> Result<CircuitPermit, Duration> {
        let now = Instant::now();
        let cooldown = self.settings.cooldown;
        let cell = self
            .circuits
            .cell(endpoint, || CircuitBreakerState::new(now, cooldown));
        let (admission, generation) = {
            let mut state = cell.lock();
            let admission = state.transition(CircuitEvent::Admit, now, &self.settings, endpoint);
            (admission, state.generation)
        };

        let trial = match admission {
            Admission::Rejected { retry_after } => return Err(retry_after),
            Admission::Trial => true,
            Admission::Allowed | Admission::Recorded => false,
        };
        Ok(CircuitPermit {
            cell,
            settings: self.settings,
            endpoint: endpoint.to_string(),
            generation,
            trial,
            settled: false,
        })
    }

    /// Record a success for `endpoint` outside of a permit.
    ///
    /// Outcomes recorded this way only count while the circuit is closed.
    pub fn record_success(&self, endpoint: &str) {
        self.apply(endpoint, CircuitEvent::Success);
    }

    /// Record a failure for `endpoint` outside of a permit.
    ///
    /// Outcomes recorded this way only count while the circuit is closed.
    pub fn record_failure(&self, endpoint: &str) {
        self.apply(endpoint, CircuitEvent::Failure);
    }

    /// Current state of `endpoint`. Unknown endpoints are closed.
    #[must_use]
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits
            .peek(endpoint, |s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Detailed view of `endpoint`, if it has been seen.
    #[must_use]
    pub fn snapshot(&self, endpoint: &str) -> Option<CircuitSnapshot> {
        self.circuits.peek(endpoint, CircuitBreakerState::snapshot)
    }

    /// Forget all state for `endpoint`, closing its circuit.
    pub fn reset(&self, endpoint: &str) {
        self.circuits.remove(endpoint);
    }

    /// Number of endpoints currently tracked.
    #[must_use]
    pub fn tracked_endpoints(&self) -> usize {
        self.circuits.len()
    }

    fn apply(&self, endpoint: &str, event: CircuitEvent) {
        let now = Instant::now();
        let cooldown = self.settings.cooldown;
        self.circuits.with(
            endpoint,
            || CircuitBreakerState::new(now, cooldown),
            |state| state.transition(event, now, &self.settings, endpoint),
        );
    }
}

/// Admission to send one call through a circuit.
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping a trial permit without a
/// verdict frees the trial slot for the next caller. Outcomes of permits
/// granted before the circuit last opened are ignored.
pub struct CircuitPermit {
    cell: Arc<Mutex<CircuitBreakerState>>,
    settings: CircuitSettings,
    endpoint: String,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    /// Whether this permit is the half-open trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report that the call succeeded.
    pub fn record_success(mut self) {
        self.settle(CircuitEvent::Success);
    }

    /// Report that the call failed.
    pub fn record_failure(mut self) {
        self.settle(CircuitEvent::Failure);
    }

    fn settle(&mut self, event: CircuitEvent) {
        self.settled = true;
        let mut state = self.cell.lock();
        if state.generation != self.generation {
            return;
        }
        let event = match (self.trial, event) {
            (true, CircuitEvent::Success) => CircuitEvent::TrialSuccess,
            (true, CircuitEvent::Failure) => CircuitEvent::TrialFailure,
            (_, event) => event,
        };
        state.transition(event, Instant::now(), &self.settings, &self.endpoint);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.settle(CircuitEvent::AbandonTrial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window: f64, cooldown: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            &CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_window(window)
                .with_cooldown(cooldown),
        )
        .unwrap()
    }

    fn fail(cb: &CircuitBreaker, endpoint: &str, times: u32) {
        for _ in 0..times {
            cb.admit(endpoint).unwrap().record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_closed() {
        let cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert!(cb.admit("svc").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failures() {
        let cb = breaker(3, 10.0, 30.0);
        fail(&cb, "svc", 2);
        assert_eq!(cb.state("svc"), CircuitState::Closed);

        fail(&cb, "svc", 1);
        assert_eq!(cb.state("svc"), CircuitState::Open);
        assert_eq!(cb.admit("svc").err(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 10.0, 30.0);
        fail(&cb, "svc", 2);
        cb.admit("svc").unwrap().record_success();

        assert_eq!(cb.snapshot("svc").unwrap().failure_count, 0);
        fail(&cb, "svc", 2);
        assert_eq!(cb.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let cb = breaker(3, 10.0, 30.0);
        fail(&cb, "svc", 2);
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&cb, "svc", 2);

        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert_eq!(cb.snapshot("svc").unwrap().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(2, 10.0, 5.0);
        fail(&cb, "svc", 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.admit("svc").unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state("svc"), CircuitState::HalfOpen);
        assert!(cb.admit("svc").is_err());

        trial.record_success();
        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert!(cb.admit("svc").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_with_backoff() {
        let cb = CircuitBreaker::new(
            &CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(10.0)
                .with_cooldown_backoff(2.0, 25.0),
        )
        .unwrap();
        fail(&cb, "svc", 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        cb.admit("svc").unwrap().record_failure();
        assert_eq!(cb.admit("svc").err(), Some(Duration::from_secs(20)));

        tokio::time::advance(Duration::from_secs(20)).await;
        cb.admit("svc").unwrap().record_failure();
        assert_eq!(cb.admit("svc").err(), Some(Duration::from_secs(25)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let cb = breaker(1, 10.0, 1.0);
        fail(&cb, "svc", 1);
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(cb.admit("svc").unwrap());
        let next = cb.admit("svc").unwrap();
        assert!(next.is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_does_not_decide_half_open() {
        let cb = breaker(2, 10.0, 5.0);
        let slow = cb.admit("svc").unwrap();
        fail(&cb, "svc", 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = cb.admit("svc").unwrap();
        assert!(trial.is_trial());
        slow.record_success();

        assert_eq!(cb.state("svc"), CircuitState::HalfOpen);
        assert_eq!(cb.admit("svc").err(), Some(Duration::ZERO));
        trial.record_success();
        assert_eq!(cb.state("svc"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_reopen_half_open() {
        let cb = CircuitBreaker::new(
            &CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(5.0)
                .with_cooldown_backoff(2.0, 60.0),
        )
        .unwrap();
        let slow = cb.admit("svc").unwrap();
        fail(&cb, "svc", 1);
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = cb.admit("svc").unwrap();
        slow.record_failure();
        assert_eq!(cb.state("svc"), CircuitState::HalfOpen);

        trial.record_failure();
        assert_eq!(cb.admit("svc").err(), Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_outcome_ignored_after_recovery() {
        let cb = breaker(2, 10.0, 5.0);
        let slow = cb.admit("svc").unwrap();
        fail(&cb, "svc", 2);
        tokio::time::advance(Duration::from_secs(5)).await;
        cb.admit("svc").unwrap().record_success();
        assert_eq!(cb.state("svc"), CircuitState::Closed);

        slow.record_failure();
        assert_eq!(cb.snapshot("svc").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_cooldown_multiplier_is_capped() {
        let cb = CircuitBreaker::new(
            &CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_cooldown(1.0)
                .with_cooldown_backoff(1e300, 1e6),
        )
        .unwrap();
        fail(&cb, "svc", 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        cb.admit("svc").unwrap().record_failure();

        assert_eq!(cb.admit("svc").err(), Some(Duration::from_secs(1_000_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoints_are_independent() {
        let cb = breaker(1, 10.0, 30.0);
        fail(&cb, "a", 1);
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert!(cb.admit("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1, 10.0, 30.0);
        fail(&cb, "svc", 1);
        cb.reset("svc");
        assert_eq!(cb.state("svc"), CircuitState::Closed);
        assert!(cb.snapshot("svc").is_none());
    }

    #[test]
    fn test_invalid_config() {
        assert!(
            CircuitBreakerConfig::default()
                .with_failure_threshold(0)
                .validate()
                .is_err()
        );
        assert!(CircuitBreakerConfig::default().with_window(0.0).validate().is_err());
        assert!(
            CircuitBreakerConfig::default()
                .with_cooldown_backoff(0.5, 300.0)
                .validate()
                .is_err()
        );
    }
}
