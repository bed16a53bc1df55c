//! Idempotency key manager.
//!
//! Guarantees at most one in-flight real call per key. The first caller gets
//! an [`IdempotencyGuard`] and performs the call; concurrent callers with the
//! same key and request wait for it and replay its response.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reqwest::Method;
use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::call::CallContext;
use crate::config::ConfigError;
use crate::error::{IntegratorError, IntegratorResult};
use crate::timeout::{deadline_after, secs_to_duration};
use crate::transport::Response;

/// Header used to send the idempotency key when none is configured.
pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Idempotency section of the client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdempotencyConfig {
    /// Request header carrying the key
    pub header_name: String,
    /// Record lifetime in seconds
    pub ttl: f64,
    /// Generate a key for mutating calls that do not carry one
    pub auto_generate: bool,
    /// Record count that triggers a sweep
    pub max_records: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_IDEMPOTENCY_HEADER.to_string(),
            ttl: 3600.0,
            auto_generate: false,
            max_records: 10_000,
        }
    }
}

impl IdempotencyConfig {
    /// Set the header name.
    #[must_use]
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    /// Set the record lifetime in seconds.
    #[must_use]
    pub const fn with_ttl(mut self, secs: f64) -> Self {
        self.ttl = secs;
        self
    }

    /// Generate keys for mutating calls without one.
    #[must_use]
    pub const fn with_auto_generate(mut self, enabled: bool) -> Self {
        self.auto_generate = enabled;
        self
    }

    /// Validate the section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid header name, a non-positive TTL
    /// or a zero record cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        HeaderName::from_bytes(self.header_name.as_bytes()).map_err(|_| {
            ConfigError::InvalidIdempotency(format!(
                "{:?} is not a valid header name",
                self.header_name
            ))
        })?;
        if secs_to_duration("idempotency.ttl", self.ttl)?.is_zero() {
            return Err(ConfigError::InvalidIdempotency(
                "ttl must be greater than 0".to_string(),
            ));
        }
        if self.max_records == 0 {
            return Err(ConfigError::InvalidIdempotency(
                "max_records must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// A call owning the key is executing
    InFlight,
    /// The call finished and its response is cached
    Completed,
    /// The call failed or was cancelled; the key may be claimed again
    Failed,
}

/// Read-only view of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Current state
    pub state: RecordState,
    /// Request fingerprint the key is bound to
    pub fingerprint: String,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// When the record stops being honored
    pub expires_at: Instant,
}

enum RecordStatus {
    InFlight {
        owner: u64,
        done: watch::Receiver<()>,
    },
    Completed(Response),
    Failed,
}

struct IdempotencyRecord {
    fingerprint: String,
    status: RecordStatus,
    created_at: DateTime<Utc>,
    expires_at: Instant,
}

impl IdempotencyRecord {
    fn claimable(&self, now: Instant) -> bool {
        self.expires_at <= now || matches!(self.status, RecordStatus::Failed)
    }

    fn owned_by(&self, owner: u64) -> bool {
        matches!(self.status, RecordStatus::InFlight { owner: o, .. } if o == owner)
    }
}

struct Records {
    map: DashMap<String, IdempotencyRecord>,
    next_owner: AtomicU64,
}

impl Records {
    fn resolve(&self, key: &str, owner: u64, status: RecordStatus) {
        if let Some(mut record) = self.map.get_mut(key) {
            if record.owned_by(owner) {
                record.status = status;
            }
        }
    }
}

/// Outcome of [`IdempotencyManager::begin`].
pub enum Begin {
    /// The caller now owns the key and must perform the call
    Fresh(IdempotencyGuard),
    /// Another call owns the key
    InFlight(InFlightWait),
    /// The key already completed with this response
    Completed(Response),
    /// The key is bound to a different request
    Conflict,
}

/// Result of waiting for ownership of a key.
pub enum Acquired {
    /// Perform the call and resolve the guard
    Owner(IdempotencyGuard),
    /// Return this cached response without calling
    Replay(Response),
}

/// Handle for waiting on another call that owns a key.
pub struct InFlightWait {
    done: watch::Receiver<()>,
}

impl InFlightWait {
    /// Resolve once the owning call finishes or is abandoned.
    pub async fn wait(mut self) {
        // The owner never sends; the channel closes when its guard drops.
        while self.done.changed().await.is_ok() {}
    }
}

/// Ownership of an in-flight key.
///
/// Resolve with [`complete`](Self::complete) or [`fail`](Self::fail). Dropping
/// an unresolved guard marks the record failed so a waiter can take over.
pub struct IdempotencyGuard {
    records: Arc<Records>,
    key: String,
    owner: u64,
    resolved: bool,
    _done: watch::Sender<()>,
}

impl IdempotencyGuard {
    /// The key this guard owns.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cache `response` for the rest of the record's lifetime.
    pub fn complete(mut self, response: Response) {
        self.resolved = true;
        self.records
            .resolve(&self.key, self.owner, RecordStatus::Completed(response));
    }

    /// Release the key so the next caller performs the call.
    pub fn fail(mut self) {
        self.resolved = true;
        self.records.resolve(&self.key, self.owner, RecordStatus::Failed);
    }
}

impl Drop for IdempotencyGuard {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(key = %self.key, "Idempotency slot released without a result");
            self.records.resolve(&self.key, self.owner, RecordStatus::Failed);
        }
    }
}

/// Tracks idempotency records for one client.
pub struct IdempotencyManager {
    records: Arc<Records>,
    header_name: HeaderName,
    ttl: Duration,
    auto_generate: bool,
    max_records: usize,
}

impl IdempotencyManager {
    /// Create a manager from its configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the section is invalid.
    pub fn new(config: &IdempotencyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes())
            .map_err(|e| ConfigError::InvalidIdempotency(e.to_string()))?;

        Ok(Self {
            records: Arc::new(Records {
                map: DashMap::new(),
                next_owner: AtomicU64::new(1),
            }),
            header_name,
            ttl: secs_to_duration("idempotency.ttl", config.ttl)?,
            auto_generate: config.auto_generate,
            max_records: config.max_records,
        })
    }

    /// Header the key is sent in.
    #[must_use]
    pub const fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// Whether keys are generated for mutating calls without one.
    #[must_use]
    pub const fn auto_generate(&self) -> bool {
        self.auto_generate
    }

    /// Check-and-set the record for `key`.
    pub fn begin(&self, key: &str, fingerprint: &str) -> Begin {
        let now = Instant::now();
        let outcome = match self.records.map.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                let settled = if existing.claimable(now) {
                    None
                } else if existing.fingerprint != fingerprint {
                    Some(Begin::Conflict)
                } else {
                    match &existing.status {
                        RecordStatus::InFlight { done, .. } => Some(Begin::InFlight(InFlightWait {
                            done: done.clone(),
                        })),
                        RecordStatus::Completed(response) => {
                            Some(Begin::Completed(response.clone()))
                        }
                        RecordStatus::Failed => None,
                    }
                };

                settled.unwrap_or_else(|| {
                    let (record, guard) = self.new_record(key, fingerprint, now);
                    entry.insert(record);
                    Begin::Fresh(guard)
                })
            }
            Entry::Vacant(entry) => {
                let (record, guard) = self.new_record(key, fingerprint, now);
                entry.insert(record);
                Begin::Fresh(guard)
            }
        };

        if matches!(outcome, Begin::Fresh(_)) && self.records.map.len() > self.max_records {
            self.sweep(now);
        }
        outcome
    }

    /// Wait until the caller owns `key` or can replay its response.
    ///
    /// Waiting is bounded by `budget` and by the call's cancellation scope.
    pub(crate) async fn acquire(
        &self,
        key: &str,
        fingerprint: &str,
        budget: Duration,
        ctx: &CallContext,
    ) -> IntegratorResult<Acquired> {
        let give_up = deadline_after(Instant::now(), budget);
        loop {
            match self.begin(key, fingerprint) {
                Begin::Fresh(guard) => return Ok(Acquired::Owner(guard)),
                Begin::Completed(response) => return Ok(Acquired::Replay(response)),
                Begin::Conflict => {
                    warn!(key = %key, "Idempotency key reused for a different request");
                    return Err(IntegratorError::IdempotencyConflict {
                        key: key.to_string(),
                    });
                }
                Begin::InFlight(wait) => {
                    debug!(key = %key, "Waiting for in-flight idempotent call");
                    let waited = ctx.run(tokio::time::timeout_at(give_up, wait.wait())).await?;
                    if waited.is_err() {
                        return Err(IntegratorError::IdempotencyInFlight {
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Inspect the record for `key`.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<RecordInfo> {
        self.records.map.get(key).map(|record| RecordInfo {
            state: match record.status {
                RecordStatus::InFlight { .. } => RecordState::InFlight,
                RecordStatus::Completed(_) => RecordState::Completed,
                RecordStatus::Failed => RecordState::Failed,
            },
            fingerprint: record.fingerprint.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }

    /// Drop expired records and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.map.len();
        self.records.map.retain(|_, record| record.expires_at > now);
        before.saturating_sub(self.records.map.len())
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.map.len()
    }

    /// Whether no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.map.is_empty()
    }

    fn new_record(
        &self,
        key: &str,
        fingerprint: &str,
        now: Instant,
    ) -> (IdempotencyRecord, IdempotencyGuard) {
        let owner = self.records.next_owner.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(());
        let record = IdempotencyRecord {
            fingerprint: fingerprint.to_string(),
            status: RecordStatus::InFlight { owner, done: rx },
            created_at: Utc::now(),
            expires_at: deadline_after(now, self.ttl),
        };
        let guard = IdempotencyGuard {
            records: Arc::clone(&self.records),
            key: key.to_string(),
            owner,
            resolved: false,
            _done: tx,
        };
        (record, guard)
    }

    /// Purge expired records, then evict the oldest settled ones over the cap.
    fn sweep(&self, now: Instant) {
        self.records.map.retain(|_, record| record.expires_at > now);
        let excess = self.records.map.len().saturating_sub(self.max_records);
        if excess == 0 {
            return;
        }

        let mut settled: Vec<(Instant, String)> = self
            .records
            .map
            .iter()
            .filter(|entry| !matches!(entry.status, RecordStatus::InFlight { .. }))
            .map(|entry| (entry.expires_at, entry.key().clone()))
            .collect();
        settled.sort_unstable();
        for (_, key) in settled.into_iter().take(excess) {
            self.records
                .map
                .remove_if(&key, |_, record| !matches!(record.status, RecordStatus::InFlight { .. }));
        }
    }
}

/// Hex SHA-256 of the parts of a request that must match for a replay.
#[must_use]
pub fn fingerprint(method: &Method, url: &Url, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(url.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(body.unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// A fresh random idempotency key.
#[must_use]
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Whether a method changes server state and needs an idempotency key to be replayed.
#[must_use]
pub fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;

    fn manager() -> IdempotencyManager {
        IdempotencyManager::new(&IdempotencyConfig::default()).unwrap()
    }

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::CREATED, HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_fresh_then_completed() {
        let manager = manager();
        let Begin::Fresh(guard) = manager.begin("k1", "fp") else {
            panic!("expected fresh");
        };
        assert_eq!(manager.record("k1").unwrap().state, RecordState::InFlight);

        guard.complete(ok("done"));
        match manager.begin("k1", "fp") {
            Begin::Completed(response) => assert_eq!(response.text(), "done"),
            _ => panic!("expected completed"),
        }
    }

    #[tokio::test]
    async fn test_conflict_on_different_fingerprint() {
        let manager = manager();
        let _guard = manager.begin("k1", "fp-a");
        assert!(matches!(manager.begin("k1", "fp-b"), Begin::Conflict));
    }

    #[tokio::test]
    async fn test_in_flight_for_concurrent_caller() {
        let manager = manager();
        let _guard = manager.begin("k1", "fp");
        assert!(matches!(manager.begin("k1", "fp"), Begin::InFlight(_)));
    }

    #[tokio::test]
    async fn test_dropped_guard_frees_slot() {
        let manager = manager();
        let first = manager.begin("k1", "fp");
        let Begin::InFlight(wait) = manager.begin("k1", "fp") else {
            panic!("expected in flight");
        };

        drop(first);
        wait.wait().await;
        assert_eq!(manager.record("k1").unwrap().state, RecordState::Failed);
        assert!(matches!(manager.begin("k1", "fp"), Begin::Fresh(_)));
    }

    #[tokio::test]
    async fn test_failed_slot_can_be_claimed_with_new_fingerprint() {
        let manager = manager();
        let Begin::Fresh(guard) = manager.begin("k1", "fp-a") else {
            panic!("expected fresh");
        };
        guard.fail();
        assert!(matches!(manager.begin("k1", "fp-b"), Begin::Fresh(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let manager =
            IdempotencyManager::new(&IdempotencyConfig::default().with_ttl(60.0)).unwrap();
        let Begin::Fresh(guard) = manager.begin("k1", "fp") else {
            panic!("expected fresh");
        };
        guard.complete(ok("done"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.purge_expired(), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_reclaimed() {
        let manager =
            IdempotencyManager::new(&IdempotencyConfig::default().with_ttl(60.0)).unwrap();
        let Begin::Fresh(stale) = manager.begin("k1", "fp") else {
            panic!("expected fresh");
        };

        tokio::time::advance(Duration::from_secs(61)).await;
        let Begin::Fresh(current) = manager.begin("k1", "fp") else {
            panic!("expected fresh");
        };

        stale.complete(ok("stale"));
        assert_eq!(manager.record("k1").unwrap().state, RecordState::InFlight);
        current.complete(ok("current"));
        match manager.begin("k1", "fp") {
            Begin::Completed(response) => assert_eq!(response.text(), "current"),
            _ => panic!("expected completed"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_then_replays() {
        let manager = Arc::new(manager());
        let Acquired::Owner(guard) = manager
            .acquire("k1", "fp", Duration::from_secs(5), &CallContext::default())
            .await
            .unwrap()
        else {
            panic!("expected owner");
        };

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .acquire("k1", "fp", Duration::from_secs(5), &CallContext::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.complete(ok("once"));

        match waiter.await.unwrap().unwrap() {
            Acquired::Replay(response) => assert_eq!(response.text(), "once"),
            Acquired::Owner(_) => panic!("expected replay"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_budget() {
        let manager = manager();
        let _guard = manager.begin("k1", "fp");
        let result = manager
            .acquire("k1", "fp", Duration::from_secs(1), &CallContext::default())
            .await;
        assert!(matches!(
            result,
            Err(IntegratorError::IdempotencyInFlight { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_and_budget_do_not_overflow() {
        let manager =
            IdempotencyManager::new(&IdempotencyConfig::default().with_ttl(1e15)).unwrap();
        let Acquired::Owner(guard) = manager
            .acquire("k1", "fp", Duration::MAX, &CallContext::default())
            .await
            .unwrap()
        else {
            panic!("expected owner");
        };
        assert!(manager.record("k1").unwrap().expires_at > Instant::now());
        guard.complete(ok("kept"));
        assert_eq!(manager.purge_expired(), 0);
        assert!(IdempotencyConfig::default().with_ttl(1e20).validate().is_err());
    }

    #[test]
    fn test_sweep_keeps_in_flight_records() {
        let manager = IdempotencyManager::new(&IdempotencyConfig {
            max_records: 2,
            ..IdempotencyConfig::default()
        })
        .unwrap();

        let _held = manager.begin("a", "fp");
        if let Begin::Fresh(guard) = manager.begin("b", "fp") {
            guard.fail();
        }
        let _c = manager.begin("c", "fp");

        assert_eq!(manager.len(), 2);
        assert!(manager.record("a").is_some());
        assert!(manager.record("b").is_none());
    }

    #[test]
    fn test_fingerprint_covers_method_url_body() {
        let url = Url::parse("https://api.example.com/orders").unwrap();
        let base = fingerprint(&Method::POST, &url, Some(b"{}"));

        assert_eq!(base, fingerprint(&Method::POST, &url, Some(b"{}")));
        assert_eq!(base.len(), 64);
        assert_ne!(base, fingerprint(&Method::PUT, &url, Some(b"{}")));
        assert_ne!(base, fingerprint(&Method::POST, &url, Some(b"{\"a\":1}")));
        let other = Url::parse("https://api.example.com/orders?x=1").unwrap();
        assert_ne!(base, fingerprint(&Method::POST, &other, Some(b"{}")));
    }

    #[test]
    fn test_mutating_methods() {
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
    }

    #[test]
    fn test_invalid_config() {
        assert!(
            IdempotencyConfig::default()
                .with_header_name("bad header")
                .validate()
                .is_err()
        );
        assert!(IdempotencyConfig::default().with_ttl(0.0).validate().is_err());
    }
}
