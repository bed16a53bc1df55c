//! Transport collaborator and the default reqwest-backed implementation.
//!
//! The resilience core never talks to the network directly. It hands a
//! [`TransportRequest`] and an [`EffectiveTimeout`] to a [`Transport`] and gets
//! back either a buffered [`Response`] or a categorized [`TransportError`].
//! Connection pooling, TLS and DNS stay inside the transport.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::timeout::EffectiveTimeout;

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection could not be established (refused, unreachable, connect timeout)
    Connect,
    /// No response arrived within the read timeout
    ReadTimeout,
    /// Sending the request failed part-way
    Write,
    /// No pooled connection became available in time
    PoolTimeout,
    /// Anything else the transport reports (decode, redirect loop, builder)
    Other,
}

impl TransportErrorKind {
    /// Kinds that indicate a transient network condition.
    pub const TRANSIENT: [Self; 4] = [
        Self::Connect,
        Self::ReadTimeout,
        Self::Write,
        Self::PoolTimeout,
    ];

    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ReadTimeout => "read_timeout",
            Self::Write => "write",
            Self::PoolTimeout => "pool_timeout",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure reported by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport {kind} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Create a transport error of the given kind.
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The failure category.
    #[must_use]
    pub const fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Human readable detail from the transport.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Categorize a reqwest error.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_timeout() {
            TransportErrorKind::ReadTimeout
        } else if err.is_request() || err.is_body() {
            TransportErrorKind::Write
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

/// One attempt's worth of request data handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute request URL
    pub url: Url,
    /// Request headers, including any idempotency key
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response from its parts.
    #[must_use]
    pub const fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw response body.
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Delay requested by a `Retry-After` header given in seconds.
    ///
    /// HTTP-date values are not interpreted.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

/// The network collaborator used by the request executor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one HTTP exchange within the given timeouts.
    async fn issue(
        &self,
        request: TransportRequest,
        timeout: &EffectiveTimeout,
    ) -> Result<Response, TransportError>;
}

/// Settings for the reqwest client that backs [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout applied when dialing (default: 5s)
    pub connect_timeout: Duration,
    /// Pool idle timeout (default: 90s)
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host (default: 10)
    pub pool_max_idle_per_host: usize,
    /// User agent string
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            user_agent: concat!("http-integrator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    /// Set the dial timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set pool idle timeout and per-host idle connection cap.
    #[must_use]
    pub const fn with_pool_config(mut self, idle_timeout: Duration, max_idle: usize) -> Self {
        self.pool_idle_timeout = idle_timeout;
        self.pool_max_idle_per_host = max_idle;
        self
    }
}

/// Build a configured reqwest client.
///
/// # Errors
///
/// Returns an error if the client cannot be built (e.g., TLS initialization fails).
pub fn build_http_client(config: &TransportConfig) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .build()
}

/// [`Transport`] backed by a pooled reqwest client.
///
/// reqwest only exposes a dial timeout at client level and a whole-request
/// timeout per call, so the connect dimension is fixed when the client is
/// built and each call is bounded by [`EffectiveTimeout::call_budget`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with its own reqwest client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    /// Wrap an existing reqwest client.
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn issue(
        &self,
        request: TransportRequest,
        timeout: &EffectiveTimeout,
    ) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(timeout.call_budget());
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        Ok(Response::new(status, headers, body))
    }
}
