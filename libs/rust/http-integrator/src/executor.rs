//! Request executor.
//!
//! Runs one logical call as a loop over attempts: circuit check, rate limit,
//! transport call, outcome bookkeeping and, on a retryable failure, a
//! cancellable backoff sleep before the next attempt. Mutating calls that carry
//! an idempotency key claim the key once, before the first attempt.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::call::CallContext;
use crate::circuit_breaker::{CircuitBreaker, CircuitPermit};
use crate::config::{ClientConfig, ConfigError};
use crate::error::{AttemptFailure, IntegratorError, IntegratorResult};
use crate::idempotency::{
    Acquired, IdempotencyManager, fingerprint, generate_key, is_mutating,
};
use crate::metrics::{ClientMetrics, Gauge};
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::retry::{RetryDecision, RetryPolicy, StopReason, is_idempotent_method};
use crate::timeout::{self, EffectiveTimeout, TimeoutOverride, TimeoutPolicy};
use crate::transport::{Response, Transport, TransportError, TransportRequest};

/// Identity used to partition circuit and rate-limit state: scheme, host,
/// port and path, without the query string.
///
/// # Examples
///
/// ```
/// use http_integrator::endpoint_key;
/// use url::Url;
///
/// let url = Url::parse("https://api.example.com/users?page=2").unwrap();
/// assert_eq!(endpoint_key(&url), "https://api.example.com:443/users");
/// ```
#[must_use]
pub fn endpoint_key(url: &Url) -> String {
    format!(
        "{}://{}:{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default(),
        url.path()
    )
}

/// A fully prepared logical call.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Bytes>,
    pub(crate) endpoint: String,
    pub(crate) timeout: Option<TimeoutOverride>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) deadline: Option<Instant>,
}

impl PreparedRequest {
    pub(crate) fn new(method: Method, url: Url) -> Self {
        let endpoint = endpoint_key(&url);
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            endpoint,
            timeout: None,
            idempotency_key: None,
            cancel: None,
            deadline: None,
        }
    }
}

/// What one attempt produced.
#[derive(Debug)]
enum AttemptOutcome {
    /// A response the caller receives as-is
    Success(Response),
    /// A failure the retry policy may absorb
    RetryableFailure {
        failure: AttemptFailure,
        response: Option<Response>,
    },
    /// A transport failure surfaced on first occurrence
    FatalFailure(TransportError),
}

#[derive(Debug)]
struct AttemptResult {
    outcome: AttemptOutcome,
    elapsed: Duration,
    attempt: u32,
}

struct InFlightCall<'a>(&'a Gauge);

impl<'a> InFlightCall<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Orchestrates timeouts, retries, circuit breaking, rate limiting and
/// idempotency around the transport.
pub(crate) struct RequestExecutor {
    transport: Arc<dyn Transport>,
    timeouts: TimeoutPolicy,
    retry: RetryPolicy,
    circuit: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    idempotency: Option<IdempotencyManager>,
    key_header: HeaderName,
    metrics: ClientMetrics,
}

impl RequestExecutor {
    pub(crate) fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let timeouts = match &config.timeouts {
            Some(section) => section.to_policy()?,
            None => TimeoutPolicy::unset(),
        };
        let retry = match &config.retries {
            Some(section) => RetryPolicy::from_config(section)?,
            None => RetryPolicy::disabled(),
        };
        let circuit = config
            .circuit_breaker
            .as_ref()
            .map(CircuitBreaker::new)
            .transpose()?;
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .transpose()?;
        let idempotency = config
            .idempotency
            .as_ref()
            .map(IdempotencyManager::new)
            .transpose()?;
        let key_header = idempotency.as_ref().map_or_else(
            || HeaderName::from_static("idempotency-key"),
            |manager| manager.header_name().clone(),
        );

        Ok(Self {
            transport,
            timeouts,
            retry,
            circuit,
            rate_limiter,
            idempotency,
            key_header,
            metrics: ClientMetrics::new(),
        })
    }

    pub(crate) const fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub(crate) const fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit.as_ref()
    }

    pub(crate) const fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub(crate) const fn idempotency(&self) -> Option<&IdempotencyManager> {
        self.idempotency.as_ref()
    }

    /// Execute one logical call.
    #[instrument(
        name = "http_call",
        skip_all,
        fields(method = %request.method, endpoint = %request.endpoint)
    )]
    pub(crate) async fn execute(&self, request: PreparedRequest) -> IntegratorResult<Response> {
        let _in_flight = InFlightCall::enter(&self.metrics.in_flight);
        let result = self.run(request).await;
        if let Err(err) = &result {
            self.metrics.failures.inc();
            debug!(error = %err, "Call failed");
        }
        result
    }

    async fn run(&self, request: PreparedRequest) -> IntegratorResult<Response> {
        let PreparedRequest {
            method,
            url,
            mut headers,
            body,
            endpoint,
            timeout,
            idempotency_key,
            cancel,
            deadline,
        } = request;

        let ctx = CallContext::new(cancel, deadline);
        ctx.check()?;
        let effective = timeout::resolve(&self.timeouts, timeout.as_ref())?;

        let key = idempotency_key.or_else(|| {
            self.idempotency
                .as_ref()
                .filter(|manager| manager.auto_generate() && is_mutating(&method))
                .map(|_| generate_key())
        });
        if let Some(key) = &key {
            let value = HeaderValue::from_str(key).map_err(|_| {
                IntegratorError::InvalidHeader(format!(
                    "idempotency key {key:?} is not a valid header value"
                ))
            })?;
            headers.insert(self.key_header.clone(), value);
        }
        let replay_safe = is_idempotent_method(&method) || key.is_some();

        let mut guard = None;
        if let (Some(manager), Some(key)) = (&self.idempotency, &key) {
            if is_mutating(&method) {
                let fp = fingerprint(&method, &url, body.as_deref());
                let budget = ctx
                    .remaining()
                    .map_or(effective.call_budget(), |left| left.min(effective.call_budget()));
                match manager.acquire(key, &fp, budget, &ctx).await? {
                    Acquired::Replay(response) => {
                        self.metrics.idempotent_replays.inc();
                        debug!(
                            key = %key,
                            status = response.status().as_u16(),
                            "Replaying cached response"
                        );
                        return Ok(response);
                    }
                    Acquired::Owner(owned) => guard = Some(owned),
                }
            }
        }

        let request = TransportRequest {
            method,
            url,
            headers,
            body,
        };
        let result = self
            .attempt_loop(&request, &endpoint, &effective, replay_safe, &ctx)
            .await;

        if let Some(guard) = guard {
            match &result {
                Ok(response) => guard.complete(response.clone()),
                Err(_) => guard.fail(),
            }
        }
        result
    }

    async fn attempt_loop(
        &self,
        request: &TransportRequest,
        endpoint: &str,
        effective: &EffectiveTimeout,
        replay_safe: bool,
        ctx: &CallContext,
    ) -> IntegratorResult<Response> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            ctx.check()?;

            let permit = self.admit(endpoint)?;
            self.throttle(endpoint, effective, ctx).await?;

            if attempt > 1 {
                self.metrics.retries.inc();
            }
            self.metrics.attempts.inc();

            let result = self
                .attempt(request, effective, attempt, permit, ctx)
                .await?;
            debug!(
                attempt = result.attempt,
                elapsed_ms = result.elapsed.as_millis() as u64,
                outcome = result.outcome.label(),
                "Attempt finished"
            );

            let (failure, response) = match result.outcome {
                AttemptOutcome::Success(response) => return Ok(response),
                AttemptOutcome::FatalFailure(err) => return Err(err.into()),
                AttemptOutcome::RetryableFailure { failure, response } => (failure, response),
            };

            match self.retry.should_retry(attempt, &failure, replay_safe) {
                RetryDecision::Retry(delay) => {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %failure,
                        "Retrying after backoff"
                    );
                    ctx.sleep(delay).await?;
                }
                RetryDecision::Stop(StopReason::BudgetExhausted) => {
                    warn!(attempts = attempt, last = %failure, "Retry budget exhausted");
                    return Err(IntegratorError::RetryBudgetExhausted {
                        attempts: attempt,
                        last: failure,
                    });
                }
                RetryDecision::Stop(reason) => {
                    debug!(attempt, ?reason, "Not retrying");
                    return match (failure, response) {
                        (_, Some(response)) => Ok(response),
                        (AttemptFailure::Transport(err), None) => Err(err.into()),
                        (last @ AttemptFailure::Status { .. }, None) => {
                            Err(IntegratorError::RetryBudgetExhausted {
                                attempts: attempt,
                                last,
                            })
                        }
                    };
                }
            }
        }
    }

    /// Issue one transport call and classify its outcome.
    async fn attempt(
        &self,
        request: &TransportRequest,
        effective: &EffectiveTimeout,
        attempt: u32,
        permit: Option<CircuitPermit>,
        ctx: &CallContext,
    ) -> IntegratorResult<AttemptResult> {
        let started = Instant::now();
        let issued = ctx
            .run(self.transport.issue(request.clone(), effective))
            .await?;
        let elapsed = started.elapsed();

        let outcome = match issued {
            Ok(response) => {
                let status = response.status();
                let retryable = self.retry.is_retryable_status(status);
                settle(permit, !(retryable || status.is_server_error()));

                if retryable {
                    AttemptOutcome::RetryableFailure {
                        failure: AttemptFailure::Status {
                            status,
                            retry_after: response.retry_after(),
                        },
                        response: Some(response),
                    }
                } else {
                    AttemptOutcome::Success(response)
                }
            }
            Err(err) => {
                settle(permit, false);
                if self.retry.is_retryable_error(err.kind()) {
                    AttemptOutcome::RetryableFailure {
                        failure: AttemptFailure::Transport(err),
                        response: None,
                    }
                } else {
                    AttemptOutcome::FatalFailure(err)
                }
            }
        };

        Ok(AttemptResult {
            outcome,
            elapsed,
            attempt,
        })
    }

    fn admit(&self, endpoint: &str) -> IntegratorResult<Option<CircuitPermit>> {
        let Some(circuit) = &self.circuit else {
            return Ok(None);
        };
        match circuit.admit(endpoint) {
            Ok(permit) => Ok(Some(permit)),
            Err(retry_after) => {
                self.metrics.circuit_rejections.inc();
                debug!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, failing fast"
                );
                Err(IntegratorError::circuit_open(endpoint, retry_after))
            }
        }
    }

    /// Take a rate-limit token, waiting while the total wait fits the budget.
    async fn throttle(
        &self,
        endpoint: &str,
        effective: &EffectiveTimeout,
        ctx: &CallContext,
    ) -> IntegratorResult<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let budget = limiter.max_wait().min(effective.call_budget());
        let mut waited = Duration::ZERO;

        loop {
            match limiter.acquire(endpoint) {
                RateLimitDecision::Allowed => return Ok(()),
                RateLimitDecision::Denied { retry_after } => {
                    if waited.saturating_add(retry_after) > budget {
                        self.metrics.rate_limited.inc();
                        return Err(IntegratorError::rate_limited(endpoint, retry_after));
                    }
                    debug!(
                        wait_ms = retry_after.as_millis() as u64,
                        "Waiting for rate limit token"
                    );
                    ctx.sleep(retry_after).await?;
                    waited = waited.saturating_add(retry_after);
                }
            }
        }
    }
}

fn settle(permit: Option<CircuitPermit>, success: bool) {
    if let Some(permit) = permit {
        if success {
            permit.record_success();
        } else {
            permit.record_failure();
        }
    }
}

impl AttemptOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RetryableFailure { .. } => "retryable_failure",
            Self::FatalFailure(_) => "fatal_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key_ignores_query_and_fragment() {
        let a = Url::parse("https://api.example.com/v1/users?page=1#top").unwrap();
        let b = Url::parse("https://api.example.com/v1/users?page=2").unwrap();
        assert_eq!(endpoint_key(&a), endpoint_key(&b));
        assert_eq!(endpoint_key(&a), "https://api.example.com:443/v1/users");
    }

    #[test]
    fn test_endpoint_key_separates_ports_and_paths() {
        let a = Url::parse("http://localhost:8080/orders").unwrap();
        let b = Url::parse("http://localhost:9090/orders").unwrap();
        let c = Url::parse("http://localhost:8080/payments").unwrap();
        assert_ne!(endpoint_key(&a), endpoint_key(&b));
        assert_ne!(endpoint_key(&a), endpoint_key(&c));
    }

    #[test]
    fn test_prepared_request_defaults() {
        let url = Url::parse("http://localhost/items").unwrap();
        let request = PreparedRequest::new(Method::GET, url);
        assert_eq!(request.endpoint, "http://localhost:80/items");
        assert!(request.headers.is_empty());
        assert!(request.idempotency_key.is_none());
    }
}
