//! Async client surface.
//!
//! [`Client`] is cheap to clone; clones share circuit, rate-limit and
//! idempotency state.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::circuit_breaker::CircuitState;
use crate::config::{ClientConfig, ConfigError};
use crate::error::{IntegratorError, IntegratorResult};
use crate::executor::{PreparedRequest, RequestExecutor};
use crate::idempotency::RecordInfo;
use crate::metrics::ClientMetrics;
use crate::rate_limiter::RateLimitInfo;
use crate::timeout::{TimeoutConfig, TimeoutOverride};
use crate::transport::{ReqwestTransport, Response, Transport, TransportConfig};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    headers: HeaderMap,
    body: Option<Bytes>,
    query: Vec<(String, String)>,
    timeout: Option<TimeoutOverride>,
    endpoint_key: Option<String>,
    idempotency_key: Option<String>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl RequestOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing any default with the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header from strings.
    ///
    /// # Errors
    ///
    /// Returns [`IntegratorError::InvalidHeader`] if the name or value is malformed.
    pub fn try_header(self, name: &str, value: &str) -> IntegratorResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| IntegratorError::InvalidHeader(format!("{name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| IntegratorError::InvalidHeader(format!("{name}: {e}")))?;
        Ok(self.header(name, value))
    }

    /// Set a raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns [`IntegratorError::Serialization`] if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> IntegratorResult<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Override timeouts for this call.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutOverride) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `key` instead of the URL-derived endpoint identity.
    #[must_use]
    pub fn endpoint_key(mut self, key: impl Into<String>) -> Self {
        self.endpoint_key = Some(key.into());
        self
    }

    /// Send `key` as the idempotency key.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stop the call when `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop the call at `deadline`.
    #[must_use]
    pub const fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    base_url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    default_headers: HeaderMap,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            base_url: None,
            transport: None,
            transport_config: TransportConfig::default(),
            default_headers: HeaderMap::new(),
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("base_url", &self.base_url)
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Use `config` for resilience behavior.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve relative request URLs against `url`.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Use a custom transport instead of reqwest.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Settings for the default reqwest transport.
    #[must_use]
    pub fn transport_config(mut self, transport_config: TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    /// Send `value` for `name` on every call unless the call sets it.
    #[must_use]
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Validate the configuration and build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is invalid, the base URL cannot be
    /// parsed, or the default transport cannot be built.
    pub fn build(self) -> Result<Client, ConfigError> {
        self.config.validate()?;

        let base_url = self.base_url.as_deref().map(parse_base_url).transpose()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let mut transport_config = self.transport_config;
                if let Some(connect) = self
                    .config
                    .timeouts
                    .as_ref()
                    .map(TimeoutConfig::to_policy)
                    .transpose()?
                    .and_then(|policy| policy.connect())
                {
                    transport_config = transport_config.with_connect_timeout(connect);
                }
                let transport = ReqwestTransport::new(&transport_config)
                    .map_err(|e| ConfigError::Transport(e.to_string()))?;
                Arc::new(transport)
            }
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                executor: RequestExecutor::new(&self.config, transport)?,
                base_url,
                default_headers: self.default_headers,
            }),
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: "URL cannot be used as a base".to_string(),
        });
    }
    Ok(url)
}

struct ClientInner {
    executor: RequestExecutor,
    base_url: Option<Url>,
    default_headers: HeaderMap,
}

/// Resilient async HTTP client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_ref().map(Url::as_str))
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client over reqwest with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    /// Start building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Issue a call with an arbitrary method.
    ///
    /// # Errors
    ///
    /// Returns [`IntegratorError`] when the call fails after the configured
    /// resilience behavior has run its course.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> IntegratorResult<Response> {
        let request = self.prepare(method, url, options)?;
        self.inner.executor.execute(request).await
    }

    /// Issue a GET.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::GET, url, options).await
    }

    /// Issue a POST.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::POST, url, options).await
    }

    /// Issue a PUT.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn put(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::PUT, url, options).await
    }

    /// Issue a PATCH.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn patch(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::PATCH, url, options).await
    }

    /// Issue a DELETE.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::DELETE, url, options).await
    }

    /// Issue a HEAD.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn head(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::HEAD, url, options).await
    }

    /// Issue an OPTIONS.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn options(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> IntegratorResult<Response> {
        self.request(Method::OPTIONS, url, options).await
    }

    /// Client counters.
    #[must_use]
    pub fn metrics(&self) -> &ClientMetrics {
        self.inner.executor.metrics()
    }

    /// Circuit state for an endpoint key, if circuit breaking is configured.
    #[must_use]
    pub fn circuit_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.inner
            .executor
            .circuit_breaker()
            .map(|circuit| circuit.state(endpoint))
    }

    /// Token bucket level for an endpoint key that has been called.
    #[must_use]
    pub fn rate_limit_info(&self, endpoint: &str) -> Option<RateLimitInfo> {
        self.inner
            .executor
            .rate_limiter()
            .and_then(|limiter| limiter.limit_info(endpoint))
    }

    /// Idempotency record for `key`, if one is held.
    #[must_use]
    pub fn idempotency_record(&self, key: &str) -> Option<RecordInfo> {
        self.inner
            .executor
            .idempotency()
            .and_then(|manager| manager.record(key))
    }

    /// Absolute URL a call to `url` would target.
    ///
    /// # Errors
    ///
    /// Returns [`IntegratorError::InvalidUrl`] if `url` is relative without a
    /// base URL or cannot be parsed.
    pub fn resolve_url(&self, url: &str) -> IntegratorResult<Url> {
        let resolved = match &self.inner.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        resolved.map_err(|e| IntegratorError::invalid_url(url, e))
    }

    fn prepare(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> IntegratorResult<PreparedRequest> {
        let mut url = self.resolve_url(url)?;
        if !options.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&options.query);
        }

        let mut headers = self.inner.default_headers.clone();
        headers.extend(options.headers);

        let mut request = PreparedRequest::new(method, url);
        if let Some(key) = options.endpoint_key {
            request.endpoint = key;
        }
        request.headers = headers;
        request.body = options.body;
        request.timeout = options.timeout;
        request.idempotency_key = options.idempotency_key;
        request.cancel = options.cancel;
        request.deadline = options.deadline;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_fails_build() {
        let config = ClientConfig::from_json_str("{}")
            .unwrap()
            .with_retries(crate::retry::RetryConfig::default().with_max_attempts(0));
        assert!(matches!(
            Client::new(config),
            Err(ConfigError::InvalidRetry(_))
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        let result = Client::builder().base_url("not a url").build();
        assert!(matches!(result, Err(ConfigError::InvalidBaseUrl { .. })));

        let result = Client::builder().base_url("mailto:ops@example.com").build();
        assert!(matches!(result, Err(ConfigError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn test_resolve_url() {
        let client = Client::builder()
            .base_url("https://api.example.com/v1/")
            .build()
            .unwrap();
        assert_eq!(
            client.resolve_url("users/7").unwrap().as_str(),
            "https://api.example.com/v1/users/7"
        );
        assert_eq!(
            client.resolve_url("http://other.example.com/x").unwrap().as_str(),
            "http://other.example.com/x"
        );

        let bare = Client::new(ClientConfig::default()).unwrap();
        assert!(matches!(
            bare.resolve_url("/relative"),
            Err(IntegratorError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_prepare_merges_options() {
        let client = Client::builder()
            .base_url("http://localhost:8080")
            .default_header(
                HeaderName::from_static("x-team"),
                HeaderValue::from_static("payments"),
            )
            .build()
            .unwrap();

        let options = RequestOptions::new()
            .query("page", "2")
            .try_header("x-request-id", "abc")
            .unwrap()
            .json(&serde_json::json!({"amount": 10}))
            .unwrap()
            .idempotency_key("order-1");
        let request = client.prepare(Method::POST, "/orders", options).unwrap();

        assert_eq!(request.url.as_str(), "http://localhost:8080/orders?page=2");
        assert_eq!(request.endpoint, "http://localhost:8080/orders");
        assert_eq!(request.headers["x-team"], "payments");
        assert_eq!(request.headers["x-request-id"], "abc");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.body.as_deref(), Some(br#"{"amount":10}"#.as_slice()));
        assert_eq!(request.idempotency_key.as_deref(), Some("order-1"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = RequestOptions::new().try_header("bad header", "x");
        assert!(matches!(result, Err(IntegratorError::InvalidHeader(_))));
    }

    #[test]
    fn test_endpoint_key_override() {
        let client = Client::new(ClientConfig::default()).unwrap();
        let options = RequestOptions::new().endpoint_key("users-api");
        let request = client
            .prepare(Method::GET, "https://api.example.com/users/1", options)
            .unwrap();
        assert_eq!(request.endpoint, "users-api");
    }
}
