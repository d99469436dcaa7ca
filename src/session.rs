//! ALFA Session Guard - Session Controller
//!
//! One active session at a time. Activity slides the expiry forward, capped
//! by an absolute lifetime from session start. A warning timer fires
//! `warning_before` ahead of expiry and an expiry timer ends the session and
//! clears the tokens. Events go to every subscriber over its own unbounded
//! channel, emitted under the session lock so their order is preserved.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::clock::{duration_ms, ms_to_duration, Clock, SharedClock};
use crate::config::SessionConfig;
use crate::envelope::EnvelopeCodec;
use crate::environment::DeviceIdentity;
use crate::error::{GuardError, GuardResult};
use crate::scheduler::ScheduledTask;
use crate::storage::SecureStorage;
use crate::token::TokenStore;

/// Storage slot of the sealed session
pub const SESSION_STORAGE_KEY: &str = "alfa.guard.session.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Active,
    ExpiringSoon,
    Expired,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_fingerprint: String,
    /// Epoch ms
    pub start_time: i64,
    pub expiry_time: i64,
    pub last_activity_time: i64,
    /// Idle lifetime that activity slides forward
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Logout,
    Replaced,
    DeviceMismatch,
    TokenMismatch,
    /// Fail-closed shutdown after a security error
    Lockdown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { session_id: String, user_id: String },
    ExpiringSoon { session_id: String, remaining: Duration },
    Expired { session_id: String },
    Extended { session_id: String, expiry_time: i64 },
    Restored { session_id: String },
    Ended { session_id: String, reason: EndReason },
}

struct Slot {
    session: Option<Session>,
    state: SessionState,
    timers: Vec<ScheduledTask>,
    /// Bumped on every reschedule so stale timers do nothing
    epoch: u64,
}

struct Inner {
    slot: Mutex<Slot>,
    /// Serialises storage writes and deletes of the persisted session
    store: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    codec: Arc<EnvelopeCodec>,
    storage: Arc<dyn SecureStorage>,
    device: Arc<dyn DeviceIdentity>,
    tokens: Arc<TokenStore>,
    clock: SharedClock,
    config: SessionConfig,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        tracing::debug!(?event, "session event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn capped_expiry(&self, session: &Session, candidate: i64) -> i64 {
        let cap = session.start_time
            + duration_ms(Duration::from_secs(self.config.max_lifetime_secs));
        candidate.min(cap)
    }

    fn seal(&self, session: &Session) -> GuardResult<Vec<u8>> {
        let json = Zeroizing::new(serde_json::to_vec(session)?);
        self.codec.seal_at_rest(&json, session.device_id.as_bytes())
    }

    /// Write the live session if it is still `session_id`. An ended or
    /// replaced session is never written back.
    async fn persist(&self, session_id: &str) -> GuardResult<()> {
        let _store = self.store.lock().await;
        let live = self.slot.lock().session.clone();
        match live {
            Some(session) if session.session_id == session_id => {
                let blob = self.seal(&session)?;
                self.storage.put(SESSION_STORAGE_KEY, &blob).await
            }
            _ => Ok(()),
        }
    }

    async fn forget(&self) {
        let _store = self.store.lock().await;
        if let Err(e) = self.storage.delete(SESSION_STORAGE_KEY).await {
            tracing::warn!(error = %e, "failed to delete persisted session");
        }
    }
}

/// Arms warning and expiry timers for the session in `slot`
fn schedule(inner: &Arc<Inner>, slot: &mut Slot) {
    slot.timers.clear();
    slot.epoch += 1;
    let Some(session) = slot.session.as_ref() else {
        return;
    };

    let epoch = slot.epoch;
    let until_expiry = ms_to_duration(session.expiry_time - inner.clock.now_ms());
    let warning = Duration::from_secs(inner.config.warning_before_secs);
    let remaining_at_warning = until_expiry.min(warning);

    let weak: Weak<Inner> = Arc::downgrade(inner);
    slot.timers.push(ScheduledTask::after(
        "session-warning",
        until_expiry.saturating_sub(warning),
        async move {
            if let Some(inner) = weak.upgrade() {
                on_warning(&inner, epoch, remaining_at_warning);
            }
        },
    ));

    let weak: Weak<Inner> = Arc::downgrade(inner);
    slot.timers.push(ScheduledTask::after(
        "session-expiry",
        until_expiry,
        async move {
            if let Some(inner) = weak.upgrade() {
                on_expiry(&inner, epoch).await;
            }
        },
    ));
}

fn on_warning(inner: &Inner, epoch: u64, remaining: Duration) {
    let mut slot = inner.slot.lock();
    if slot.epoch != epoch || slot.state != SessionState::Active {
        return;
    }
    let Some(session_id) = slot.session.as_ref().map(|s| s.session_id.clone()) else {
        return;
    };
    slot.state = SessionState::ExpiringSoon;
    inner.emit(SessionEvent::ExpiringSoon {
        session_id,
        remaining,
    });
}

async fn on_expiry(inner: &Inner, epoch: u64) {
    {
        let mut slot = inner.slot.lock();
        if slot.epoch != epoch
            || !matches!(slot.state, SessionState::Active | SessionState::ExpiringSoon)
        {
            return;
        }
        let Some(session) = slot.session.take() else {
            return;
        };
        slot.state = SessionState::Expired;
        tracing::info!(session_id = %session.session_id, "session expired");
        inner.emit(SessionEvent::Expired {
            session_id: session.session_id.clone(),
        });
    }

    inner.forget().await;
    if let Err(e) = inner.tokens.clear().await {
        tracing::error!(error = %e, "failed to clear tokens on session expiry");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        codec: Arc<EnvelopeCodec>,
        storage: Arc<dyn SecureStorage>,
        device: Arc<dyn DeviceIdentity>,
        tokens: Arc<TokenStore>,
        clock: SharedClock,
        config: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    session: None,
                    state: SessionState::None,
                    timers: Vec::new(),
                    epoch: 0,
                }),
                store: tokio::sync::Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                codec,
                storage,
                device,
                tokens,
                clock,
                config: config.clone(),
            }),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    pub fn current(&self) -> Option<Session> {
        self.inner.slot.lock().session.clone()
    }

    /// Start a new session, replacing any active one
    pub async fn start(
        &self,
        user_id: &str,
        device_fingerprint: &str,
        duration: Option<Duration>,
    ) -> GuardResult<Session> {
        let now = self.inner.clock.now_ms();
        let idle = duration.unwrap_or(Duration::from_secs(self.inner.config.duration_secs));

        let mut session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            device_id: self.inner.device.current_device_id(),
            device_fingerprint: device_fingerprint.to_string(),
            start_time: now,
            expiry_time: now,
            last_activity_time: now,
            idle_timeout_secs: idle.as_secs(),
        };
        session.expiry_time = self.inner.capped_expiry(&session, now + duration_ms(idle));

        {
            let mut slot = self.inner.slot.lock();
            if let Some(previous) = slot.session.take() {
                self.inner.emit(SessionEvent::Ended {
                    session_id: previous.session_id,
                    reason: EndReason::Replaced,
                });
            }
            slot.session = Some(session.clone());
            slot.state = SessionState::Active;
            schedule(&self.inner, &mut slot);
            self.inner.emit(SessionEvent::Started {
                session_id: session.session_id.clone(),
                user_id: session.user_id.clone(),
            });
        }

        self.inner.persist(&session.session_id).await?;
        tracing::info!(session_id = %session.session_id, "session started");
        Ok(session)
    }

    /// Record activity and slide the expiry forward
    pub async fn touch(&self) -> GuardResult<()> {
        let now = self.inner.clock.now_ms();
        let updated = {
            let mut slot = self.inner.slot.lock();
            if !matches!(slot.state, SessionState::Active | SessionState::ExpiringSoon) {
                return Err(GuardError::SessionExpired);
            }
            let Some(session) = slot.session.as_mut() else {
                return Err(GuardError::SessionExpired);
            };
            if now >= session.expiry_time {
                return Err(GuardError::SessionExpired);
            }

            let idle = duration_ms(Duration::from_secs(session.idle_timeout_secs));
            session.last_activity_time = now;
            let candidate = now + idle;
            if candidate > session.expiry_time {
                let capped = self.inner.capped_expiry(session, candidate);
                session.expiry_time = session.expiry_time.max(capped);
            }
            let updated = session.clone();

            let warning = duration_ms(Duration::from_secs(self.inner.config.warning_before_secs));
            if updated.expiry_time - now > warning {
                slot.state = SessionState::Active;
            }
            schedule(&self.inner, &mut slot);
            updated
        };

        self.inner.persist(&updated.session_id).await
    }

    /// Expiry, device identity and token binding must all hold. Any
    /// mismatch ends the session.
    pub async fn is_valid(&self) -> bool {
        let Some(session) = self.current() else {
            return false;
        };
        if !matches!(self.state(), SessionState::Active | SessionState::ExpiringSoon) {
            return false;
        }

        if self.inner.clock.now_ms() >= session.expiry_time {
            let epoch = self.inner.slot.lock().epoch;
            on_expiry(&self.inner, epoch).await;
            return false;
        }

        let device_id = self.inner.device.current_device_id();
        if session.device_id != device_id {
            tracing::warn!(target: "security", "session device mismatch");
            self.end_and_clear(EndReason::DeviceMismatch).await;
            return false;
        }

        if self.inner.tokens.device_binding().as_deref() != Some(device_id.as_str()) {
            tracing::warn!(target: "security", "session token binding mismatch");
            self.end_and_clear(EndReason::TokenMismatch).await;
            return false;
        }

        true
    }

    async fn end_and_clear(&self, reason: EndReason) {
        self.end(reason).await;
        if let Err(e) = self.inner.tokens.clear().await {
            tracing::error!(error = %e, "failed to clear tokens");
        }
    }

    /// Push the expiry forward by `duration` (default: the idle duration)
    pub async fn extend(&self, duration: Option<Duration>) -> GuardResult<Session> {
        let updated = {
            let mut slot = self.inner.slot.lock();
            if !matches!(slot.state, SessionState::Active | SessionState::ExpiringSoon) {
                return Err(GuardError::SessionExpired);
            }
            let Some(session) = slot.session.as_mut() else {
                return Err(GuardError::SessionExpired);
            };

            let by = duration.unwrap_or(Duration::from_secs(session.idle_timeout_secs));
            let candidate = session.expiry_time + duration_ms(by);
            session.expiry_time = self.inner.capped_expiry(session, candidate);
            let updated = session.clone();

            slot.state = SessionState::Active;
            schedule(&self.inner, &mut slot);
            self.inner.emit(SessionEvent::Extended {
                session_id: updated.session_id.clone(),
                expiry_time: updated.expiry_time,
            });
            updated
        };

        self.inner.persist(&updated.session_id).await?;
        Ok(updated)
    }

    /// Rehydrate a persisted session. Expired, foreign or unreadable
    /// sessions are deleted and false is returned.
    pub async fn restore(&self) -> GuardResult<bool> {
        let Some(blob) = self.inner.storage.get(SESSION_STORAGE_KEY).await? else {
            return Ok(false);
        };

        let device_id = self.inner.device.current_device_id();
        let session = match self
            .inner
            .codec
            .open_at_rest(&blob, device_id.as_bytes())
            .and_then(|json| Ok(serde_json::from_slice::<Session>(&Zeroizing::new(json))?))
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(target: "security", error = %e, "discarding persisted session");
                self.inner.forget().await;
                return Ok(false);
            }
        };

        let now = self.inner.clock.now_ms();
        if session.device_id != device_id || now >= session.expiry_time {
            tracing::info!("persisted session expired or bound to another device");
            self.inner.forget().await;
            return Ok(false);
        }

        {
            let mut slot = self.inner.slot.lock();
            let warning = duration_ms(Duration::from_secs(self.inner.config.warning_before_secs));
            slot.state = if session.expiry_time - now > warning {
                SessionState::Active
            } else {
                SessionState::ExpiringSoon
            };
            slot.session = Some(session.clone());
            schedule(&self.inner, &mut slot);
            self.inner.emit(SessionEvent::Restored {
                session_id: session.session_id.clone(),
            });
        }

        tracing::info!(session_id = %session.session_id, "session restored");
        Ok(true)
    }

    /// End the active session, if any
    pub async fn end(&self, reason: EndReason) {
        let ended = {
            let mut slot = self.inner.slot.lock();
            slot.timers.clear();
            slot.epoch += 1;
            let ended = slot.session.take();
            if let Some(session) = ended.as_ref() {
                slot.state = SessionState::Ended;
                self.inner.emit(SessionEvent::Ended {
                    session_id: session.session_id.clone(),
                    reason: reason.clone(),
                });
            }
            ended
        };

        if let Some(session) = ended {
            tracing::info!(session_id = %session.session_id, ?reason, "session ended");
            self.inner.forget().await;
        }
    }

    /// Re-seal the persisted session under the current storage key
    pub async fn reseal(&self) -> GuardResult<()> {
        match self.current() {
            Some(session) => self.inner.persist(&session.session_id).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .finish()
    }
}
