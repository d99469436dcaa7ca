//! ALFA Session Guard - Single-Flight Token Refresh
//!
//! At most one refresh runs at a time. Callers that arrive while one is in
//! flight subscribe to its outcome on a `watch` channel and all receive the
//! same result. The refresh runs on its own task, so dropping a waiting
//! caller never cancels it, and a panicking refresher still clears the
//! in-flight slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{GuardError, GuardResult};
use crate::token::{TokenGrant, TokenStore};
use crate::transport::{headers, HttpRequest, Method, Transport};

/// Exchanges a refresh token for a new grant
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> GuardResult<TokenGrant>;
}

/// Outcome shared with every waiter: the new access token or the failure
type Outcome = Option<GuardResult<String>>;

pub struct RefreshCoordinator {
    inflight: Mutex<Option<watch::Receiver<Outcome>>>,
    tokens: Arc<TokenStore>,
    refresher: Arc<dyn Refresher>,
    completed: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(tokens: Arc<TokenStore>, refresher: Arc<dyn Refresher>) -> Self {
        Self {
            inflight: Mutex::new(None),
            tokens,
            refresher,
            completed: AtomicU64::new(0),
        }
    }

    /// Number of refreshes that actually ran
    pub fn refresh_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inflight.lock().is_some()
    }

    /// Join the in-flight refresh or start one
    pub async fn refresh(self: &Arc<Self>) -> GuardResult<String> {
        let mut rx = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(rx) => {
                    tracing::debug!("joining in-flight token refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let worker = Arc::clone(&this);
                        let outcome = match tokio::spawn(async move { worker.run().await }).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                tracing::error!(error = %e, "token refresh task failed");
                                Err(GuardError::TransportFailure("refresh task aborted".into()))
                            }
                        };
                        this.completed.fetch_add(1, Ordering::SeqCst);
                        *this.inflight.lock() = None;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(GuardError::TransportFailure("refresh task aborted".into()));
            }
        }
    }

    /// Refresh unless another caller already replaced `stale_token`
    pub async fn refresh_if_stale(self: &Arc<Self>, stale_token: &str) -> GuardResult<String> {
        if let Some(current) = self.tokens.get_access().await {
            if current != stale_token && !self.tokens.is_expired() {
                tracing::debug!("token already rotated by a concurrent refresh");
                return Ok(current);
            }
        }
        self.refresh().await
    }

    async fn run(&self) -> GuardResult<String> {
        tracing::info!("refreshing access token");
        let refresh_token = self
            .tokens
            .get_refresh()
            .await
            .ok_or(GuardError::Unauthorized)?;

        let grant = match self.refresher.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed");
                return Err(e);
            }
        };

        if !self.tokens.rotate(&grant).await {
            return Err(GuardError::Storage("token rotation was rolled back".into()));
        }
        Ok(grant.access_token.clone())
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .field("completed", &self.refresh_count())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP REFRESHER
// ═══════════════════════════════════════════════════════════════════════════════

/// POSTs the refresh token to the refresh endpoint
pub struct HttpRefresher {
    transport: Arc<dyn Transport>,
    path: String,
    timeout: Duration,
}

impl HttpRefresher {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Refresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &str) -> GuardResult<TokenGrant> {
        let body = serde_json::to_vec(&serde_json::json!({ "refresh_token": refresh_token }))?;
        let request = HttpRequest::new(Method::Post, self.path.clone())
            .with_header(headers::CONTENT_TYPE, "application/json")
            .with_header(headers::REQUEST_ID, uuid::Uuid::new_v4().to_string())
            .with_body(body);

        let response = tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| GuardError::TransportFailure("refresh timed out".into()))??;
        response.error_for_status()?;

        Ok(serde_json::from_slice(&response.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EnvelopeConfig, TokenConfig};
    use crate::envelope::EnvelopeCodec;
    use crate::environment::StaticDeviceIdentity;
    use crate::nonce::NonceRegistry;
    use crate::storage::MemoryStorage;
    use crate::transport::{HttpResponse, TransportError};
    use std::sync::atomic::AtomicUsize;

    struct SlowRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Refresher for SlowRefresher {
        async fn refresh(&self, refresh_token: &str) -> GuardResult<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.fail {
                return Err(GuardError::Unauthorized);
            }
            assert_eq!(refresh_token, "rt-0");
            Ok(TokenGrant::new(format!("at-{}", n), None, Some(3600)))
        }
    }

    async fn token_store() -> Arc<TokenStore> {
        let clock = Arc::new(ManualClock::starting_now());
        let nonces = Arc::new(NonceRegistry::new(Duration::from_secs(300), clock.clone()));
        let codec = Arc::new(
            EnvelopeCodec::load_or_create(
                nonces,
                Arc::new(MemoryStorage::new()),
                clock.clone(),
                &EnvelopeConfig::default(),
            )
            .await
            .unwrap(),
        );
        let tokens = Arc::new(TokenStore::new(
            codec,
            Arc::new(MemoryStorage::new()),
            Arc::new(StaticDeviceIdentity::new("device-a")),
            clock,
            &TokenConfig::default(),
        ));
        tokens
            .save(&TokenGrant::new("at-0", Some("rt-0".into()), Some(3600)), None)
            .await
            .unwrap();
        tokens
    }

    fn coordinator(tokens: Arc<TokenStore>, fail: bool) -> (Arc<SlowRefresher>, Arc<RefreshCoordinator>) {
        let refresher = Arc::new(SlowRefresher {
            calls: AtomicUsize::new(0),
            fail,
        });
        let coordinator = Arc::new(RefreshCoordinator::new(tokens, refresher.clone()));
        (refresher, coordinator)
    }

    #[tokio::test]
    async fn test_ten_concurrent_callers_one_refresh() {
        let tokens = token_store().await;
        let (refresher, coordinator) = coordinator(tokens.clone(), false);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = Arc::clone(&coordinator);
                tokio::spawn(async move { c.refresh().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "at-1");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert_eq!(tokens.get_access().await.as_deref(), Some("at-1"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let tokens = token_store().await;
        let (refresher, coordinator) = coordinator(tokens.clone(), true);

        let (a, b) = tokio::join!(coordinator.refresh(), coordinator.refresh());
        assert_eq!(a, Err(GuardError::Unauthorized));
        assert_eq!(b, Err(GuardError::Unauthorized));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.get_access().await.as_deref(), Some("at-0"));
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_refresh() {
        let tokens = token_store().await;
        let (refresher, coordinator) = coordinator(tokens.clone(), false);

        let c = Arc::clone(&coordinator);
        let caller = tokio::spawn(async move { c.refresh().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.get_access().await.as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn test_refresh_if_stale_skips_when_rotated() {
        let tokens = token_store().await;
        let (refresher, coordinator) = coordinator(tokens.clone(), false);

        assert_eq!(coordinator.refresh_if_stale("at-0").await.unwrap(), "at-1");
        // A late caller still holding at-0 gets the rotated token without a new refresh
        assert_eq!(coordinator.refresh_if_stale("at-0").await.unwrap(), "at-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    /// First grant carries an absurd lifetime, the second panics, later ones are normal
    struct ErraticRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Refresher for ErraticRefresher {
        async fn refresh(&self, _refresh_token: &str) -> GuardResult<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match n {
                1 => Ok(TokenGrant::new("at-huge", None, Some(u64::MAX))),
                2 => panic!("refresher blew up"),
                _ => Ok(TokenGrant::new(format!("at-{}", n), None, Some(3600))),
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_survives_huge_lifetime_and_panic() {
        let tokens = token_store().await;
        let refresher = Arc::new(ErraticRefresher {
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(tokens.clone(), refresher.clone()));

        assert_eq!(coordinator.refresh().await.unwrap(), "at-huge");
        assert!(!tokens.is_expired());
        assert!(!coordinator.is_refreshing());

        assert_eq!(
            coordinator.refresh().await,
            Err(GuardError::TransportFailure("refresh task aborted".into()))
        );
        assert!(!coordinator.is_refreshing());

        assert_eq!(coordinator.refresh().await.unwrap(), "at-3");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.refresh_count(), 3);
        assert_eq!(tokens.get_access().await.as_deref(), Some("at-3"));
    }

    struct CannedTransport(HttpResponse);

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            assert_eq!(request.path, "/auth/refresh");
            assert!(request.header(headers::REQUEST_ID).is_some());
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_http_refresher() {
        let ok = HttpRefresher::new(
            Arc::new(CannedTransport(HttpResponse::new(
                200,
                r#"{"access_token":"new","refresh_token":"rt-2","expires_in":900}"#,
            ))),
            "/auth/refresh",
            Duration::from_secs(30),
        );
        let grant = ok.refresh("rt-1").await.unwrap();
        assert_eq!(grant.access_token, "new");
        assert_eq!(grant.expires_in, Some(900));

        let denied = HttpRefresher::new(
            Arc::new(CannedTransport(HttpResponse::new(401, Vec::new()))),
            "/auth/refresh",
            Duration::from_secs(30),
        );
        assert_eq!(denied.refresh("rt-1").await, Err(GuardError::Unauthorized));
    }
}
