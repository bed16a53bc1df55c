//! Mock transport for testing.
//!
//! [`MockTransport`] answers calls from a script of [`MockReply`] values and
//! falls back to a fixed reply once the script runs out.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_integrator::{
    EffectiveTimeout, Response, Transport, TransportError, TransportErrorKind, TransportRequest,
};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

/// One scripted answer.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: Result<(StatusCode, HeaderMap, Bytes), TransportErrorKind>,
    delay: Option<Duration>,
}

impl MockReply {
    /// Reply with `status` and an empty body.
    ///
    /// # Panics
    ///
    /// Panics if `status` is not a valid HTTP status code.
    #[must_use]
    pub fn status(status: u16) -> Self {
        let status = StatusCode::from_u16(status).expect("valid status code");
        Self {
            outcome: Ok((status, HeaderMap::new(), Bytes::new())),
            delay: None,
        }
    }

    /// Reply 200 with `body`.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::status(200).with_body(body)
    }

    /// Reply with `status` and `value` serialized as JSON.
    ///
    /// # Panics
    ///
    /// Panics if `value` cannot be serialized.
    #[must_use]
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).expect("serializable body");
        Self::status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Fail with a transport error of `kind`.
    #[must_use]
    pub const fn error(kind: TransportErrorKind) -> Self {
        Self {
            outcome: Err(kind),
            delay: None,
        }
    }

    /// Add a response header.
    ///
    /// # Panics
    ///
    /// Panics if the name or value is malformed.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Ok((_, headers, _)) = &mut self.outcome {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).expect("valid header name"),
                HeaderValue::from_str(value).expect("valid header value"),
            );
        }
        self
    }

    /// Replace the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        if let Ok((_, _, current)) = &mut self.outcome {
            *current = body.into();
        }
        self
    }

    /// Wait `delay` before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A call observed by the mock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// HTTP method
    pub method: Method,
    /// Request URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
    /// Timeouts the executor passed in
    pub timeout: EffectiveTimeout,
    /// When the call arrived
    pub at: Instant,
}

/// Scripted transport that records calls.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<MockReply>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A mock that answers every call with an empty 200.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockReply::status(200)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A mock that answers with `replies` in order, then with an empty 200.
    #[must_use]
    pub fn with_replies(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let mock = Self::new();
        mock.script.lock().extend(replies);
        mock
    }

    /// Queue another reply.
    pub fn push(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Answer with `reply` once the script is exhausted.
    pub fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock() = reply;
    }

    /// Number of calls observed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Gaps between consecutive calls.
    #[must_use]
    pub fn gaps(&self) -> Vec<Duration> {
        self.calls
            .lock()
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn issue(
        &self,
        request: TransportRequest,
        timeout: &EffectiveTimeout,
    ) -> Result<Response, TransportError> {
        self.calls.lock().push(RecordedCall {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
            timeout: *timeout,
            at: Instant::now(),
        });

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        match reply.outcome {
            Ok((status, headers, body)) => Ok(Response::new(status, headers, body)),
            Err(kind) => Err(TransportError::new(kind, format!("mock {kind} failure"))),
        }
    }
}
