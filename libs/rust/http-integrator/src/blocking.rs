//! Blocking client surface.
//!
//! Drives the same executor as [`Client`] on a private current-thread runtime,
//! so one call occupies the calling thread until it finishes. Must not be used
//! from inside an async context.

use reqwest::Method;
use tokio::runtime::{Builder, Runtime};

use crate::circuit_breaker::CircuitState;
use crate::client::{Client, ClientBuilder, RequestOptions};
use crate::config::{ClientConfig, ConfigError};
use crate::error::IntegratorResult;
use crate::metrics::ClientMetrics;
use crate::transport::Response;

/// Resilient blocking HTTP client.
#[derive(Debug)]
pub struct BlockingClient {
    runtime: Runtime,
    client: Client,
}

impl BlockingClient {
    /// Build a blocking client over reqwest with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the runtime
    /// cannot start.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::from_builder(Client::builder().config(config))
    }

    /// Build a blocking client from an async client builder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the builder fails or the runtime cannot start.
    pub fn from_builder(builder: ClientBuilder) -> Result<Self, ConfigError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Runtime(e.to_string()))?;
        let client = {
            let _entered = runtime.enter();
            builder.build()?
        };
        Ok(Self { runtime, client })
    }

    /// Issue a call with an arbitrary method.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> IntegratorResult<Response> {
        self.runtime
            .block_on(self.client.request(method, url, options))
    }

    /// Issue a GET.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn get(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::GET, url, options)
    }

    /// Issue a POST.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn post(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::POST, url, options)
    }

    /// Issue a PUT.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn put(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::PUT, url, options)
    }

    /// Issue a PATCH.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn patch(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::PATCH, url, options)
    }

    /// Issue a DELETE.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn delete(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::DELETE, url, options)
    }

    /// Issue a HEAD.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn head(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::HEAD, url, options)
    }

    /// Issue an OPTIONS.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn options(&self, url: &str, options: RequestOptions) -> IntegratorResult<Response> {
        self.request(Method::OPTIONS, url, options)
    }

    /// Client counters.
    #[must_use]
    pub fn metrics(&self) -> &ClientMetrics {
        self.client.metrics()
    }

    /// Circuit state for an endpoint key, if circuit breaking is configured.
    #[must_use]
    pub fn circuit_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.client.circuit_state(endpoint)
    }

    /// The async client sharing this client's state.
    #[must_use]
    pub const fn as_async(&self) -> &Client {
        &self.client
    }
}
