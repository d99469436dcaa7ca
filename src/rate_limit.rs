//! ALFA Session Guard - Sliding Window Rate Limiter
//!
//! Keeps a log of admission timestamps per (endpoint, method, identity).
//! A call is admitted while fewer than `max_requests` entries fall inside the
//! window. Windows live in a `DashMap`, so independent keys never contend on
//! one lock, and check-and-append for a key happens under its entry lock.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{duration_ms, ms_to_duration, Clock, SharedClock};
use crate::config::{LockoutConfig, RateLimitConfig};
use crate::error::{GuardError, GuardResult};
use crate::lockout::{LockoutSnapshot, LockoutTracker};
use crate::scheduler::ScheduledTask;
use crate::storage::SecureStorage;

/// Storage slot for persisted windows and lockouts
pub const RATE_LIMIT_STORAGE_KEY: &str = "alfa.guard.ratelimit.v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateKey {
    pub endpoint: String,
    pub method: String,
    pub identity: String,
}

impl RateKey {
    pub fn new(endpoint: &str, method: &str, identity: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            method: method.to_ascii_uppercase(),
            identity: identity.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowSnapshot {
    key: RateKey,
    admitted: Vec<i64>,
}

/// Persisted limiter state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    windows: Vec<WindowSnapshot>,
    #[serde(default)]
    lockouts: LockoutSnapshot,
}

impl LimiterSnapshot {
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

pub struct RateLimiter {
    windows: DashMap<RateKey, VecDeque<i64>>,
    lockout: LockoutTracker,
    config: RateLimitConfig,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, lockout: &LockoutConfig, clock: SharedClock) -> Self {
        Self {
            windows: DashMap::new(),
            lockout: LockoutTracker::new(lockout, Arc::clone(&clock)),
            config: config.clone(),
            clock,
        }
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    /// Effective limit for an endpoint. Overrides match on whole path
    /// segments, first match wins.
    pub fn limit_for(&self, endpoint: &str, method: &str) -> RateLimit {
        let route = endpoint.split('?').next().unwrap_or(endpoint);
        self.config
            .endpoints
            .iter()
            .find(|o| {
                let path_hit = route == o.endpoint
                    || route
                        .strip_prefix(o.endpoint.as_str())
                        .is_some_and(|rest| rest.starts_with('/'));
                let method_hit = o
                    .method
                    .as_deref()
                    .map_or(true, |m| m.eq_ignore_ascii_case(method));
                path_hit && method_hit
            })
            .map(|o| RateLimit::new(o.max_requests, Duration::from_secs(o.window_secs)))
            .unwrap_or_else(|| {
                RateLimit::new(
                    self.config.default_max_requests,
                    Duration::from_secs(self.config.default_window_secs),
                )
            })
    }

    fn prune(log: &mut VecDeque<i64>, cutoff: i64) {
        while log.front().is_some_and(|&t| t <= cutoff) {
            log.pop_front();
        }
    }

    /// Admit or refuse under the key's entry lock. On refusal returns the
    /// wait until the oldest entry leaves the window.
    fn try_admit(&self, key: &RateKey, limit: RateLimit) -> Result<(), Duration> {
        let now = self.clock.now_ms();
        let window = duration_ms(limit.window);
        let mut log = self.windows.entry(key.clone()).or_default();
        Self::prune(&mut log, now - window);

        if log.len() < limit.max_requests as usize {
            log.push_back(now);
            return Ok(());
        }

        let oldest = log.front().copied().unwrap_or(now);
        Err(ms_to_duration(oldest + window - now))
    }

    /// Admit one call under an explicit limit
    pub fn admit(&self, key: &RateKey, limit: RateLimit) -> bool {
        self.try_admit(key, limit).is_ok()
    }

    /// Admit one call under the configured limit for its endpoint
    pub fn check(&self, key: &RateKey) -> GuardResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let limit = self.limit_for(&key.endpoint, &key.method);
        self.try_admit(key, limit).map_err(|retry_after| {
            tracing::warn!(
                target: "security",
                endpoint = %key.endpoint,
                method = %key.method,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            GuardError::RateLimited { retry_after }
        })
    }

    /// Time until the key can be admitted again, zero when it can now
    pub fn retry_after(&self, key: &RateKey) -> Duration {
        let limit = self.limit_for(&key.endpoint, &key.method);
        let now = self.clock.now_ms();
        let window = duration_ms(limit.window);

        let Some(mut log) = self.windows.get_mut(key) else {
            return Duration::ZERO;
        };
        Self::prune(&mut log, now - window);
        if log.len() < limit.max_requests as usize {
            return Duration::ZERO;
        }
        log.front()
            .map_or(Duration::ZERO, |&oldest| ms_to_duration(oldest + window - now))
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Prune every window and drop empty ones, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|key, log| {
            let limit = self.limit_for(&key.endpoint, &key.method);
            Self::prune(log, now - duration_ms(limit.window));
            !log.is_empty()
        });
        let dropped = before.saturating_sub(self.windows.len());
        let lockouts = self.lockout.sweep();
        tracing::debug!(dropped, lockouts, "rate limiter sweep");
        dropped
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PERSISTENCE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            windows: self
                .windows
                .iter()
                .map(|entry| WindowSnapshot {
                    key: entry.key().clone(),
                    admitted: entry.value().iter().copied().collect(),
                })
                .collect(),
            lockouts: self.lockout.snapshot(),
        }
    }

    /// Replace in-memory windows and lockouts with a snapshot
    pub fn restore(&self, snapshot: LimiterSnapshot) {
        self.windows.clear();
        for window in snapshot.windows {
            let mut admitted = window.admitted;
            admitted.sort_unstable();
            self.windows.insert(window.key, admitted.into_iter().collect());
        }
        self.lockout.restore(snapshot.lockouts);
    }

    pub async fn persist(&self, storage: &dyn SecureStorage) -> GuardResult<()> {
        let data = serde_json::to_vec(&self.snapshot())?;
        storage.put(RATE_LIMIT_STORAGE_KEY, &data).await
    }

    /// Load persisted state. Returns false when nothing usable was stored.
    pub async fn rehydrate(&self, storage: &dyn SecureStorage) -> GuardResult<bool> {
        let Some(data) = storage.get(RATE_LIMIT_STORAGE_KEY).await? else {
            return Ok(false);
        };
        match serde_json::from_slice::<LimiterSnapshot>(&data) {
            Ok(snapshot) => {
                tracing::debug!(windows = snapshot.window_count(), "rate limiter rehydrated");
                self.restore(snapshot);
                self.sweep();
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable rate limiter state");
                Ok(false)
            }
        }
    }

    /// Sweep and persist on the configured interval while the limiter lives
    pub fn start_sweeper(self: &Arc<Self>, storage: Arc<dyn SecureStorage>) -> ScheduledTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        ScheduledTask::periodic("rate-limit-sweep", period, move || {
            let weak = weak.clone();
            let storage = Arc::clone(&storage);
            async move {
                let Some(limiter) = weak.upgrade() else {
                    return;
                };
                limiter.sweep();
                if let Err(e) = limiter.persist(storage.as_ref()).await {
                    tracing::warn!(error = %e, "failed to persist rate limiter state");
                }
            }
        })
    }
}
