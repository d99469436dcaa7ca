//! ALFA Session Guard - Nonce Registry
//!
//! Issues short-lived random nonces and validates each at most once.
//! Locally issued nonces are consumed on first use. Nonces minted by the
//! server are remembered on first sighting so a replayed response is refused.
//! Both kinds stay in the registry as tombstones until their window ends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;

use crate::clock::{duration_ms, Clock, SharedClock};
use crate::crypto::keys::{random_bytes, NONCE_LEN};
use crate::scheduler::ScheduledTask;

/// Length of a general-purpose nonce
pub const REQUEST_NONCE_LEN: usize = 16;

/// Random single-use token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; REQUEST_NONCE_LEN]);

impl Nonce {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceState {
    /// Issued here, not yet used
    Issued,
    /// Issued here and used
    Consumed,
    /// Minted by the peer and already accepted once
    Seen,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: NonceState,
    expires_at_ms: i64,
}

/// Registry of issued and observed nonces
pub struct NonceRegistry {
    entries: Mutex<HashMap<Vec<u8>, Entry>>,
    validity: Duration,
    clock: SharedClock,
}

impl NonceRegistry {
    pub fn new(validity: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            validity,
            clock,
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    fn register(&self, bytes: &[u8]) {
        let expires_at_ms = self.clock.now_ms().saturating_add(duration_ms(self.validity));
        self.entries.lock().insert(
            bytes.to_vec(),
            Entry {
                state: NonceState::Issued,
                expires_at_ms,
            },
        );
    }

    /// Issue a 16-byte nonce valid for the configured window
    pub fn issue(&self) -> Nonce {
        let nonce = Nonce(random_bytes::<REQUEST_NONCE_LEN>());
        self.register(nonce.as_bytes());
        nonce
    }

    /// Issue a 12-byte nonce for AES-GCM
    pub fn issue_aead(&self) -> [u8; NONCE_LEN] {
        let nonce = random_bytes::<NONCE_LEN>();
        self.register(&nonce);
        nonce
    }

    /// True exactly once per issued nonce inside its window
    pub fn validate(&self, nonce: &[u8]) -> bool {
        self.consume(nonce)
    }

    /// Atomically check and invalidate a locally issued nonce
    pub fn consume(&self, nonce: &[u8]) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match entries.get_mut(nonce) {
            Some(entry) if entry.state == NonceState::Issued && now < entry.expires_at_ms => {
                entry.state = NonceState::Consumed;
                true
            }
            _ => false,
        }
    }

    /// Accept a peer-minted nonce on first sighting, refuse any repeat
    pub fn admit_remote(&self, nonce: &[u8]) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        if entries.contains_key(nonce) {
            return false;
        }
        entries.insert(
            nonce.to_vec(),
            Entry {
                state: NonceState::Seen,
                expires_at_ms: now.saturating_add(duration_ms(self.validity)),
            },
        );
        true
    }

    /// Consume a local nonce or admit a remote one, under one lock
    pub fn accept(&self, nonce: &[u8]) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match entries.get_mut(nonce) {
            Some(entry) => {
                if entry.state == NonceState::Issued && now < entry.expires_at_ms {
                    entry.state = NonceState::Consumed;
                    true
                } else {
                    false
                }
            }
            None => {
                entries.insert(
                    nonce.to_vec(),
                    Entry {
                        state: NonceState::Seen,
                        expires_at_ms: now.saturating_add(duration_ms(self.validity)),
                    },
                );
                true
            }
        }
    }

    /// Drop entries whose window has ended, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at_ms > now);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::trace!(removed, remaining = entries.len(), "nonce sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sweep every `period` while the registry is alive
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) -> ScheduledTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        ScheduledTask::periodic("nonce-sweep", period, move || {
            let weak = weak.clone();
            async move {
                if let Some(registry) = weak.upgrade() {
                    registry.sweep();
                }
            }
        })
    }
}

impl std::fmt::Debug for NonceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceRegistry")
            .field("entries", &self.len())
            .field("validity", &self.validity)
            .finish()
    }
}
