//! Client metrics in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    #[must_use]
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get the metric name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Format as Prometheus text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        exposition(self.name, self.help, "counter", self.get())
    }
}

/// A value that moves up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    #[must_use]
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        exposition(self.name, self.help, "gauge", self.get())
    }
}

fn exposition(name: &str, help: &str, kind: &str, value: u64) -> String {
    format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n")
}

/// Counters for one client.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Transport calls issued
    pub attempts: Counter,
    /// Attempts that followed a failed one
    pub retries: Counter,
    /// Calls rejected by an open circuit
    pub circuit_rejections: Counter,
    /// Calls rejected by the rate limiter
    pub rate_limited: Counter,
    /// Calls answered from the idempotency cache
    pub idempotent_replays: Counter,
    /// Logical calls that ended in an error
    pub failures: Counter,
    /// Logical calls currently executing
    pub in_flight: Gauge,
}

impl ClientMetrics {
    /// Create zeroed metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempts: Counter::new(
                "http_integrator_attempts_total",
                "Transport calls issued",
            ),
            retries: Counter::new(
                "http_integrator_retries_total",
                "Attempts issued after a failed attempt",
            ),
            circuit_rejections: Counter::new(
                "http_integrator_circuit_rejections_total",
                "Calls rejected by an open circuit breaker",
            ),
            rate_limited: Counter::new(
                "http_integrator_rate_limited_total",
                "Calls rejected by the rate limiter",
            ),
            idempotent_replays: Counter::new(
                "http_integrator_idempotent_replays_total",
                "Calls answered from the idempotency cache",
            ),
            failures: Counter::new(
                "http_integrator_failures_total",
                "Logical calls that ended in an error",
            ),
            in_flight: Gauge::new(
                "http_integrator_in_flight_calls",
                "Logical calls currently executing",
            ),
        }
    }

    /// Format all metrics as Prometheus text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        [
            self.attempts.to_prometheus(),
            self.retries.to_prometheus(),
            self.circuit_rejections.to_prometheus(),
            self.rate_limited.to_prometheus(),
            self.idempotent_replays.to_prometheus(),
            self.failures.to_prometheus(),
            self.in_flight.to_prometheus(),
        ]
        .concat()
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}
