//! Request executor: the single path every authenticated call takes.
//!
//! Per call:
//!
//! ```text
//! Attempting -> Done
//!            -> 401: Refreshing -> Attempting (replay, free) | Failed (session cleared)
//!            -> 401, credential renewed elsewhere: Attempting (replay, free, once)
//!            -> 408: Backoff -> Attempting (consumes a retry)
//!            -> other error: Failed
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{ApiError, RetryPolicy};
use crate::auth::{CredentialStore, RefreshCoordinator, SessionManager};

#[derive(Clone)]
pub struct RequestExecutor {
    store: Arc<CredentialStore>,
    refresh: RefreshCoordinator,
    session: Arc<SessionManager>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        store: Arc<CredentialStore>,
        refresh: RefreshCoordinator,
        session: Arc<SessionManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            refresh,
            session,
            policy,
        }
    }

    /// Run `build` with the current credential, recovering from expiry and
    /// retrying timeouts.
    ///
    /// `build` performs the network call and returns a typed error carrying
    /// the status on non-2xx responses. It may be invoked several times.
    pub async fn execute<T, F, Fut>(&self, mut build: F) -> Result<T, ApiError>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 1;
        let mut refreshed = false;
        let mut adopted_newer = false;
        let mut credential = self.store.token().await;

        loop {
            debug!(attempt, authenticated = credential.is_some(), "Sending request");
            let err = match build(credential.clone()).await {
                Ok(value) => {
                    debug!(attempt, refreshed, "Request succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_unauthorized() {
                if refreshed {
                    warn!(attempt, "Credential rejected again after refresh");
                    return Err(self.expire_session().await);
                }

                // Someone else may already have renewed the credential we sent
                if !adopted_newer {
                    let current = self.store.token().await;
                    if current.is_some() && current != credential {
                        debug!(attempt, "Credential changed meanwhile, replaying");
                        adopted_newer = true;
                        credential = current;
                        continue;
                    }
                }
                refreshed = true;

                info!(attempt, "Credential rejected, refreshing");
                match self.refresh.refresh().await {
                    Ok(token) => {
                        // Replays don't count against the retry budget
                        credential = Some(token);
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Credential refresh failed, signing out");
                        return Err(self.expire_session().await);
                    }
                }
            }

            if err.is_retryable() {
                if self.policy.allows_retry_after(attempt) {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Request timed out, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                error!(attempts = attempt, error = %err, "Request failed after retries");
                return Err(ApiError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            debug!(attempt, error = %err, "Request failed");
            return Err(err);
        }
    }

    async fn expire_session(&self) -> ApiError {
        self.session.clear_session().await;
        ApiError::AuthExpired
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::auth::refresh::testing::ScriptedIssuer;
    use crate::auth::{RefreshError, UserIdentity};
    use crate::realtime::connector::testing::PendingConnector;
    use crate::realtime::ChannelManager;

    struct Harness {
        executor: RequestExecutor,
        issuer: Arc<ScriptedIssuer>,
        store: Arc<CredentialStore>,
        session: Arc<SessionManager>,
    }

    async fn harness(issuer: ScriptedIssuer, policy: RetryPolicy) -> Harness {
        let issuer = Arc::new(issuer);
        let store = Arc::new(CredentialStore::in_memory());
        let refresh = RefreshCoordinator::new(
            issuer.clone(),
            Arc::clone(&store),
            RetryPolicy::new(3, Duration::from_secs(1)),
            Duration::from_secs(45 * 60),
        );
        let channel = ChannelManager::new(
            Arc::new(PendingConnector),
            Arc::clone(&store),
            RetryPolicy::new(5, Duration::from_secs(1)),
            Duration::from_secs(30),
        );
        let session = Arc::new(SessionManager::new(
            Arc::clone(&store),
            refresh.clone(),
            channel,
        ));
        let user = UserIdentity {
            id: "1".into(),
            email: "sam@example.com".into(),
            display_name: None,
            role: None,
        };
        session.set_session(user, "tok-old").await.unwrap();

        Harness {
            executor: RequestExecutor::new(Arc::clone(&store), refresh, Arc::clone(&session), policy),
            issuer,
            store,
            session,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retried_with_backoff() {
        let h = harness(ScriptedIssuer::issuing("unused"), policy(3)).await;
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result = h
            .executor
            .execute(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ApiError::RequestTimeout("slow".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(h.issuer.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_budget() {
        let h = harness(ScriptedIssuer::issuing("unused"), policy(3)).await;
        let calls = AtomicU32::new(0);

        let err = h
            .executor
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ApiError::Timeout("deadline".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, ApiError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(408));
        assert!(h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refreshes_and_replays_for_free() {
        // Only two attempts: if the replay consumed one, the timeout would exhaust it
        let h = harness(ScriptedIssuer::issuing("tok-new"), policy(2)).await;
        let calls = AtomicU32::new(0);

        let result = h
            .executor
            .execute(|token| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    match (n, token.as_deref()) {
                        (_, Some("tok-old")) => Err(ApiError::Unauthorized),
                        (2, Some("tok-new")) => Err(ApiError::RequestTimeout("slow".into())),
                        (_, Some("tok-new")) => Ok("payload"),
                        _ => Err(ApiError::InvalidResponse("unexpected credential".into())),
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.issuer.calls(), 1);
        assert_eq!(h.store.token().await.as_deref(), Some("tok-new"));
        assert!(h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_exhaustion_clears_session() {
        let h = harness(
            ScriptedIssuer::failing(RefreshError::Rejected {
                status: Some(401),
                message: "revoked".into(),
            }),
            policy(3),
        )
        .await;

        let err = h
            .executor
            .execute(|_| async { Err::<(), _>(ApiError::Unauthorized) })
            .await
            .unwrap_err();

        assert!(err.is_auth_expired());
        assert_eq!(h.issuer.calls(), 3);
        assert!(!h.session.is_authenticated());
        assert!(h.store.token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_unauthorized_is_terminal() {
        let h = harness(ScriptedIssuer::issuing("tok-new"), policy(3)).await;
        let calls = AtomicU32::new(0);

        let err = h
            .executor
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ApiError::Unauthorized) }
            })
            .await
            .unwrap_err();

        assert!(err.is_auth_expired());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.issuer.calls(), 1);
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_unauthorized_share_one_refresh() {
        let h = harness(ScriptedIssuer::issuing("tok-new"), policy(3)).await;

        let requests = (0..5).map(|_| {
            h.executor.execute(|token| async move {
                match token.as_deref() {
                    Some("tok-new") => Ok(()),
                    _ => Err(ApiError::Unauthorized),
                }
            })
        });
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.issuer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_renewed_elsewhere_still_refreshes_on_rejection() {
        let h = harness(ScriptedIssuer::issuing("tok-new"), policy(3)).await;
        let seen = std::sync::Mutex::new(Vec::new());

        let result = h
            .executor
            .execute(|token| {
                seen.lock().unwrap().push(token.clone());
                let store = Arc::clone(&h.store);
                async move {
                    match token.as_deref() {
                        Some("tok-old") => {
                            // Another caller renewed meanwhile
                            store.set_token("tok-other").await.unwrap();
                            Err(ApiError::Unauthorized)
                        }
                        Some("tok-other") => Err(ApiError::Unauthorized),
                        Some("tok-new") => Ok(()),
                        _ => Err(ApiError::InvalidResponse("unexpected credential".into())),
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Some("tok-old".to_string()),
                Some("tok-other".to_string()),
                Some("tok-new".to_string())
            ]
        );
        assert_eq!(h.issuer.calls(), 1);
        assert!(h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_propagate_unchanged() {
        let h = harness(ScriptedIssuer::issuing("unused"), policy(3)).await;
        let calls = AtomicU32::new(0);

        let err = h
            .executor
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ApiError::NotFound("job 9".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::NotFound(ref m) if m == "job 9"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_attached() {
        let h = harness(ScriptedIssuer::issuing("unused"), policy(3)).await;
        let seen = h
            .executor
            .execute(|token| async move { Ok::<_, ApiError>(token) })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("tok-old"));
    }
}
