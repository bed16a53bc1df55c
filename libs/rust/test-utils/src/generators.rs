//! Shared proptest generators.
//!
//! Strategies for configuration sections, timeout overrides and request
//! shapes used by the http-integrator property tests.

use http_integrator::{RetryConfig, TimeoutConfig, TimeoutOverride, TransportErrorKind};
use proptest::prelude::*;

/// Generate valid timeout values in seconds, including zero.
pub fn timeout_secs_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![Just(0.0), 0.001f64..600.0]
}

/// Generate invalid timeout values: negative, non-finite or too large for a duration.
pub fn invalid_secs_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1_000.0f64..-0.000_001,
        1e20f64..f64::MAX,
        Just(f64::MAX),
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
    ]
}

/// Generate valid timeout sections with optional write and pool values.
pub fn timeout_config_strategy() -> impl Strategy<Value = TimeoutConfig> {
    (
        timeout_secs_strategy(),
        timeout_secs_strategy(),
        proptest::option::of(timeout_secs_strategy()),
        proptest::option::of(timeout_secs_strategy()),
    )
        .prop_map(|(connect, read, write, pool)| TimeoutConfig {
            connect,
            read,
            write,
            pool,
        })
}

/// Generate per-call overrides with any subset of dimensions set.
pub fn timeout_override_strategy() -> impl Strategy<Value = TimeoutOverride> {
    (
        proptest::option::of(timeout_secs_strategy()),
        proptest::option::of(timeout_secs_strategy()),
        proptest::option::of(timeout_secs_strategy()),
        proptest::option::of(timeout_secs_strategy()),
    )
        .prop_map(|(connect, read, write, pool)| TimeoutOverride {
            connect,
            read,
            write,
            pool,
        })
}

/// Generate valid retry sections without jitter.
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u32..10, 0.001f64..1.0, 1.0f64..100.0).prop_map(|(max_attempts, base, factor)| {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff_base(base)
            .with_backoff_max(base * factor)
            .without_jitter()
    })
}

/// Generate HTTP status codes across all classes.
pub fn status_code_strategy() -> impl Strategy<Value = u16> {
    prop_oneof![
        200u16..300,
        400u16..452,
        Just(429u16),
        500u16..512,
    ]
}

/// Generate transport failure kinds.
pub fn transport_error_kind_strategy() -> impl Strategy<Value = TransportErrorKind> {
    prop_oneof![
        Just(TransportErrorKind::Connect),
        Just(TransportErrorKind::ReadTimeout),
        Just(TransportErrorKind::Write),
        Just(TransportErrorKind::PoolTimeout),
        Just(TransportErrorKind::Other),
    ]
}

/// Generate absolute endpoint URLs.
pub fn endpoint_url_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("http"), Just("https")],
        "[a-z]{3,12}",
        proptest::option::of(1024u16..65535),
        proptest::collection::vec("[a-z0-9]{1,8}", 0..4),
        proptest::option::of("[a-z]{1,5}=[a-z0-9]{1,5}"),
    )
        .prop_map(|(scheme, host, port, segments, query)| {
            let port = port.map(|p| format!(":{p}")).unwrap_or_default();
            let query = query.map(|q| format!("?{q}")).unwrap_or_default();
            format!(
                "{scheme}://{host}.example.com{port}/{}{query}",
                segments.join("/")
            )
        })
}

/// Generate idempotency keys.
pub fn idempotency_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{8,64}"
}
