//! Credential cache and single-flight refresh coordination.
//!
//! Any number of requests can discover an expired credential at the same
//! moment. The [`RefreshCoordinator`] funnels them into one refresh call: the
//! first caller starts a refresh task, everyone arriving while it runs awaits
//! the same shared result, and the handle is dropped once it settles so the
//! next refresh starts clean.
//!
//! A freshly issued credential is cached for a TTL shorter than its real
//! lifetime, so callers asking for a valid credential skip the network until
//! the cache entry ages out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::token::TokenClaims;
use super::CredentialStore;
use crate::api::{ApiError, RetryPolicy};

/// Share of the credential's real lifetime the cache entry lives for
/// (45 of 60 minutes).
const CACHE_LIFETIME_NUMERATOR: u32 = 3;
const CACHE_LIFETIME_DENOMINATOR: u32 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh request timed out: {0}")]
    Timeout(String),

    #[error("Refresh rejected{}: {message}", status.map(|s| format!(" (status {})", s)).unwrap_or_default())]
    Rejected { status: Option<u16>, message: String },

    #[error("Refresh request failed: {0}")]
    Transport(String),

    #[error("Credential refresh failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RefreshError>,
    },

    #[error("Refresh task ended unexpectedly: {0}")]
    Aborted(String),

    #[error("Session ended while the refresh was running")]
    Superseded,
}

pub type RefreshResult = Result<String, RefreshError>;

/// Backend able to renew the bearer credential.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Ask the identity backend for a new credential.
    async fn refresh(&self) -> RefreshResult;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    success: bool,
    token: Option<String>,
    message: Option<String>,
}

/// Renews the credential with `POST <refresh-path>` and an empty body.
///
/// The request is authenticated by the session cookie held in the shared
/// client's cookie jar, not by the (possibly expired) bearer credential.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn refresh(&self) -> RefreshResult {
        let response = self.client.post(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                RefreshError::Timeout(e.to_string())
            } else {
                RefreshError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if status.as_u16() == 408 {
            return Err(RefreshError::Timeout(ApiError::message_from_body(&body)));
        }
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: Some(status.as_u16()),
                message: ApiError::message_from_body(&body),
            });
        }

        let parsed: RefreshResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::Rejected {
                status: Some(status.as_u16()),
                message: format!("Unreadable refresh response: {}", e),
            })?;
        match parsed {
            RefreshResponse {
                success: true,
                token: Some(token),
                ..
            } if !token.is_empty() => Ok(token),
            RefreshResponse { message, .. } => Err(RefreshError::Rejected {
                status: Some(status.as_u16()),
                message: message.unwrap_or_else(|| "Refresh response carried no token".into()),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedCredential {
    token: String,
    expires_at: Instant,
}

impl CachedCredential {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counters exported for monitoring.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    joined: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetricsSnapshot {
    /// Calls made to the issuer
    pub attempts: u64,
    /// Refresh operations that produced a credential
    pub successes: u64,
    /// Refresh operations that ran out of attempts
    pub failures: u64,
    /// Issuer calls that timed out
    pub timeouts: u64,
    /// Callers that attached to an already running refresh
    pub joined: u64,
}

impl RefreshMetrics {
    pub fn snapshot(&self) -> RefreshMetricsSnapshot {
        RefreshMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

struct InFlight {
    id: u64,
    operation: SharedRefresh,
}

struct Inner {
    issuer: Arc<dyn TokenIssuer>,
    store: Arc<CredentialStore>,
    policy: RetryPolicy,
    fallback_ttl: Duration,
    cache: RwLock<Option<CachedCredential>>,
    inflight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    /// Bumped by `invalidate`; a refresh started in an older epoch must not
    /// install its result
    epoch: AtomicU64,
    metrics: RefreshMetrics,
}

/// Caches the latest credential and deduplicates concurrent refreshes.
///
/// Clone is cheap; clones share the cache and the in-flight handle.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        issuer: Arc<dyn TokenIssuer>,
        store: Arc<CredentialStore>,
        policy: RetryPolicy,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                store,
                policy,
                fallback_ttl,
                cache: RwLock::new(None),
                inflight: Mutex::new(None),
                next_id: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                metrics: RefreshMetrics::default(),
            }),
        }
    }

    /// Return the cached credential while it is fresh, otherwise refresh.
    pub async fn get_valid_credential(&self) -> RefreshResult {
        if let Some(token) = self.cached().await {
            debug!("Credential cache hit");
            return Ok(token);
        }
        self.refresh().await
    }

    /// Refresh the credential, joining an in-flight refresh if there is one.
    pub async fn refresh(&self) -> RefreshResult {
        let operation = {
            let mut slot = self.inner.inflight.lock().await;
            match slot.as_ref() {
                Some(inflight) => {
                    self.inner.metrics.joined.fetch_add(1, Ordering::Relaxed);
                    debug!("Joining in-flight credential refresh");
                    inflight.operation.clone()
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let operation = Self::start(Arc::clone(&self.inner), id);
                    *slot = Some(InFlight {
                        id,
                        operation: operation.clone(),
                    });
                    operation
                }
            }
        };
        operation.await
    }

    /// Spawn the refresh so it runs to completion even if every waiter
    /// loses interest; its result still lands in the cache.
    ///
    /// Called with the in-flight slot locked, so the epoch read here is
    /// ordered against `invalidate`.
    fn start(inner: Arc<Inner>, id: u64) -> SharedRefresh {
        let epoch = inner.epoch.load(Ordering::SeqCst);
        let task_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let result = task_inner.perform_refresh(epoch).await;
            task_inner.release(id).await;
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Credential refresh task failed");
                    inner.release(id).await;
                    Err(RefreshError::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the cached credential and detach any running refresh, whose
    /// result will be discarded. Called when the session changes hands.
    pub async fn invalidate(&self) {
        let mut slot = self.inner.inflight.lock().await;
        let mut cache = self.inner.cache.write().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        cache.take();
        if slot.take().is_some() {
            debug!("Detached in-flight credential refresh");
        }
    }

    pub fn metrics(&self) -> RefreshMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    async fn cached(&self) -> Option<String> {
        let now = Instant::now();
        {
            let cache = self.inner.cache.read().await;
            match cache.as_ref() {
                Some(entry) if entry.is_fresh(now) => return Some(entry.token.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired entries are discarded, never served
        let mut cache = self.inner.cache.write().await;
        if cache.as_ref().is_some_and(|entry| !entry.is_fresh(now)) {
            debug!("Discarding expired cached credential");
            cache.take();
        }
        None
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Clear the in-flight slot if it still holds operation `id`.
    async fn release(&self, id: u64) {
        let mut slot = self.inflight.lock().await;
        if slot.as_ref().is_some_and(|inflight| inflight.id == id) {
            slot.take();
        }
    }

    async fn perform_refresh(&self, epoch: u64) -> RefreshResult {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(attempt, max_attempts, "Requesting credential refresh");

            match self.issuer.refresh().await {
                Ok(token) => {
                    if !self.install(&token, epoch).await {
                        debug!("Discarding credential refreshed for an ended session");
                        return Err(RefreshError::Superseded);
                    }
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "Credential refreshed");
                    return Ok(token);
                }
                Err(err) => {
                    if matches!(err, RefreshError::Timeout(_)) {
                        self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                    }

                    if !self.policy.allows_retry_after(attempt) {
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        error!(attempts = attempt, error = %err, "Credential refresh exhausted");
                        return Err(RefreshError::Exhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    if !self.is_current(epoch) {
                        debug!("Session ended, abandoning credential refresh");
                        return Err(RefreshError::Superseded);
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Credential refresh failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Persist a new credential and cache it, unless the session was
    /// invalidated since `epoch`. Returns whether it was installed.
    async fn install(&self, token: &str, epoch: u64) -> bool {
        // Held across the store write so `invalidate` can't interleave
        let mut cache = self.cache.write().await;
        if !self.is_current(epoch) {
            return false;
        }

        if let Err(e) = self.store.set_token(token).await {
            // The in-memory copy is already updated; only durability is lost
            warn!(error = %e, "Failed to persist refreshed credential");
        }

        let ttl = self.ttl_for(token);
        debug!(ttl_secs = ttl.as_secs(), "Caching refreshed credential");
        let now = Instant::now();
        *cache = Some(CachedCredential {
            token: token.to_string(),
            expires_at: now.checked_add(ttl).unwrap_or(now + self.fallback_ttl),
        });
        true
    }

    /// Cache TTL: three quarters of the lifetime stated in the token's
    /// claims, never past its actual expiry. Opaque tokens use the fallback.
    fn ttl_for(&self, token: &str) -> Duration {
        let Some(claims) = TokenClaims::decode(token) else {
            return self.fallback_ttl;
        };
        let Some(lifetime) = claims.lifetime() else {
            return self.fallback_ttl;
        };

        let Some(proactive) = lifetime
            .checked_mul(CACHE_LIFETIME_NUMERATOR)
            .map(|scaled| scaled / CACHE_LIFETIME_DENOMINATOR)
        else {
            return self.fallback_ttl;
        };
        match claims.expires_at() {
            Some(exp) => {
                let remaining = (exp - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                proactive.min(remaining)
            }
            // `exp` outside the representable calendar
            None => self.fallback_ttl,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Issuer that replays scripted outcomes, then keeps issuing `fallback`.
    pub struct ScriptedIssuer {
        calls: AtomicU32,
        script: std::sync::Mutex<VecDeque<RefreshResult>>,
        fallback: RefreshResult,
        latency: Duration,
    }

    impl ScriptedIssuer {
        pub fn new(fallback: RefreshResult) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback,
                latency: Duration::from_millis(50),
            }
        }

        pub fn issuing(token: &str) -> Self {
            Self::new(Ok(token.to_string()))
        }

        pub fn failing(err: RefreshError) -> Self {
            Self::new(Err(err))
        }

        pub fn then(self, outcome: RefreshResult) -> Self {
            self.script.lock().unwrap().push_back(outcome);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenIssuer for ScriptedIssuer {
        async fn refresh(&self) -> RefreshResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        }
    }
}
