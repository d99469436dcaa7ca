//! ALFA Session Guard - Failed Login Lockout
//!
//! Counts failed logins per identity. Reaching the threshold inside the
//! lockout window locks the identity until the oldest counted failure ages
//! out. Failures recorded while locked are not counted, so the lockout start
//! never moves.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{duration_ms, ms_to_duration, Clock, SharedClock};
use crate::config::LockoutConfig;
use crate::error::{GuardError, GuardResult};

/// Persisted failure history, identity -> failure timestamps (ms)
pub type LockoutSnapshot = HashMap<String, Vec<i64>>;

pub struct LockoutTracker {
    failures: Mutex<HashMap<String, VecDeque<i64>>>,
    max_failures: usize,
    lockout: Duration,
    clock: SharedClock,
}

impl LockoutTracker {
    pub fn new(config: &LockoutConfig, clock: SharedClock) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            max_failures: config.max_failures as usize,
            lockout: Duration::from_secs(config.lockout_secs),
            clock,
        }
    }

    fn prune(history: &mut VecDeque<i64>, cutoff: i64) {
        while history.front().is_some_and(|&t| t <= cutoff) {
            history.pop_front();
        }
    }

    /// Record a login outcome. Success clears the history.
    pub fn record_attempt(&self, identity: &str, success: bool) {
        let mut failures = self.failures.lock();
        if success {
            failures.remove(identity);
            return;
        }

        let now = self.clock.now_ms();
        let history = failures.entry(identity.to_string()).or_default();
        Self::prune(history, now - duration_ms(self.lockout));

        if history.len() >= self.max_failures {
            tracing::debug!(identity, "failure while locked out, not counted");
            return;
        }

        history.push_back(now);
        if history.len() >= self.max_failures {
            tracing::warn!(
                target: "security",
                identity,
                failures = history.len(),
                "identity locked out"
            );
        }
    }

    /// Remaining lockout time, measured from the oldest counted failure
    pub fn is_locked(&self, identity: &str) -> Option<Duration> {
        let now = self.clock.now_ms();
        let mut failures = self.failures.lock();
        let history = failures.get_mut(identity)?;
        Self::prune(history, now - duration_ms(self.lockout));

        if history.len() < self.max_failures {
            if history.is_empty() {
                failures.remove(identity);
            }
            return None;
        }

        let oldest = *history.front()?;
        let remaining = oldest + duration_ms(self.lockout) - now;
        (remaining > 0).then(|| ms_to_duration(remaining))
    }

    /// `Err(LockedOut)` while the identity is locked
    pub fn check(&self, identity: &str) -> GuardResult<()> {
        match self.is_locked(identity) {
            Some(remaining) => Err(GuardError::LockedOut { remaining }),
            None => Ok(()),
        }
    }

    pub fn failure_count(&self, identity: &str) -> usize {
        self.failures.lock().get(identity).map_or(0, |h| h.len())
    }

    /// Drop histories with no failure inside the window
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - duration_ms(self.lockout);
        let mut failures = self.failures.lock();
        let before = failures.len();
        failures.retain(|_, history| {
            Self::prune(history, cutoff);
            !history.is_empty()
        });
        before - failures.len()
    }

    pub fn snapshot(&self) -> LockoutSnapshot {
        self.failures
            .lock()
            .iter()
            .map(|(id, history)| (id.clone(), history.iter().copied().collect()))
            .collect()
    }

    /// Replace in-memory history with a persisted snapshot
    pub fn restore(&self, snapshot: LockoutSnapshot) {
        let mut failures = self.failures.lock();
        failures.clear();
        for (identity, mut history) in snapshot {
            history.sort_unstable();
            failures.insert(identity, history.into_iter().collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn tracker() -> (Arc<ManualClock>, LockoutTracker) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let tracker = LockoutTracker::new(&LockoutConfig::default(), clock.clone());
        (clock, tracker)
    }

    #[test]
    fn test_five_failures_lock_for_fifteen_minutes() {
        let (clock, tracker) = tracker();
        for _ in 0..4 {
            tracker.record_attempt("ana@example.com", false);
            clock.advance(Duration::from_secs(10));
        }
        assert!(tracker.is_locked("ana@example.com").is_none());

        tracker.record_attempt("ana@example.com", false);
        let remaining = tracker.is_locked("ana@example.com").unwrap();
        // Measured from the first failure 40s ago
        assert_eq!(remaining, Duration::from_secs(900 - 40));
    }

    #[test]
    fn test_extra_failure_does_not_move_start() {
        let (clock, tracker) = tracker();
        for _ in 0..5 {
            tracker.record_attempt("id", false);
        }
        clock.advance(Duration::from_secs(60));
        tracker.record_attempt("id", false);

        assert_eq!(tracker.is_locked("id"), Some(Duration::from_secs(840)));
        assert_eq!(tracker.failure_count("id"), 5);

        clock.advance(Duration::from_secs(840));
        assert!(tracker.is_locked("id").is_none());
        assert!(tracker.check("id").is_ok());
    }

    #[test]
    fn test_success_clears_history() {
        let (_, tracker) = tracker();
        for _ in 0..3 {
            tracker.record_attempt("id", false);
        }
        tracker.record_attempt("id", true);
        assert_eq!(tracker.failure_count("id"), 0);
    }

    #[test]
    fn test_snapshot_restore_keeps_lockout() {
        let (clock, tracker) = tracker();
        for _ in 0..5 {
            tracker.record_attempt("id", false);
        }
        let snapshot = tracker.snapshot();

        let restored = LockoutTracker::new(&LockoutConfig::default(), clock.clone());
        restored.restore(snapshot);
        assert!(matches!(
            restored.check("id"),
            Err(GuardError::LockedOut { .. })
        ));
    }
}
