//! Subscriber setup for applications embedding the client.
//!
//! The library only emits `tracing` events. Each logical call runs inside an
//! `http_call` span with one `debug` event per attempt, so enabling span
//! close events gives a per-call latency line for free.

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ConfigError;

const CRATE_TARGET: &str = "http_integrator";

/// Subscriber options, also accepted as the `tracing` section of
/// [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TracingConfig {
    /// Base filter, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Level for this crate's events, appended to the base filter
    pub client_level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json_output: bool,
    /// Log a line with timings when each `http_call` span closes
    pub span_timing: bool,
    /// Colorize human-readable output
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            client_level: Some("debug".to_string()),
            json_output: false,
            span_timing: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Set the base filter.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the level for client events, or `None` to inherit the base filter.
    #[must_use]
    pub fn with_client_level(mut self, level: Option<&str>) -> Self {
        self.client_level = level.map(str::to_string);
        self
    }

    /// Enable JSON output.
    #[must_use]
    pub const fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Log call timings on span close.
    #[must_use]
    pub const fn with_span_timing(mut self) -> Self {
        self.span_timing = true;
        self
    }

    /// Disable colors.
    #[must_use]
    pub const fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    /// Filter directives this configuration expands to.
    #[must_use]
    pub fn directives(&self) -> String {
        match &self.client_level {
            Some(level) => format!("{},{CRATE_TARGET}={level}", self.log_level),
            None => self.log_level.clone(),
        }
    }

    /// Check that the directives parse as a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTracing`] with the parser message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        EnvFilter::try_new(self.directives())
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidTracing(e.to_string()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over [`TracingConfig::directives`].
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_output {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(config.span_events())
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(config.ansi)
                    .with_span_events(config.span_events()),
            )
            .try_init()
    }
}
