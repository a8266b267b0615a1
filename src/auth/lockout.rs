use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::store::secure::SecureStore;
use crate::utils::clock::{Clock, SharedClock};

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCKOUT_MINUTES: i64 = 15;

const LOCKOUT_KEY: &str = "auth.lockout";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockoutRecord {
    attempt_count: u32,
    /// Fixed to the first failure of the current streak; later failures do
    /// not move it, so the lock always clears 15 minutes after the streak
    /// began.
    first_failure_at: i64,
}

/// Failed sign-in accounting for one browser profile.
///
/// Clear until the first failure, accumulating up to
/// [`MAX_FAILED_ATTEMPTS`], then locked. The lock clears lazily on the next
/// status check after the window elapses; there is no timer. Counters live
/// in the same obfuscated store as the session, so concurrent tabs can race
/// on them; the lockout is a deterrent, not a security boundary (the
/// authority enforces its own limits).
pub struct LockoutTracker {
    store: SecureStore,
    clock: SharedClock,
}

impl LockoutTracker {
    pub fn new(store: SecureStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    fn load(&self) -> Option<LockoutRecord> {
        let raw = self.store.get(LOCKOUT_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("lockout: evicting malformed record: {err}");
                self.store.remove(LOCKOUT_KEY);
                None
            }
        }
    }

    fn save(&self, record: &LockoutRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(err) => {
                log::warn!("lockout: failed to serialize record: {err}");
                return;
            }
        };
        // TTL measured from the first failure of the streak, so rewriting
        // the record on later failures does not extend the window.
        let ttl = self.unlock_instant(record) - self.clock.now().timestamp();
        self.store
            .save(LOCKOUT_KEY, &json, Some(Duration::seconds(ttl.max(0))));
    }

    fn unlock_instant(&self, record: &LockoutRecord) -> i64 {
        record.first_failure_at + LOCKOUT_MINUTES * 60
    }

    fn expired(&self, record: &LockoutRecord) -> bool {
        self.clock.now().timestamp() >= self.unlock_instant(record)
    }

    /// Current lock status. Clears a stale record as a side effect.
    pub fn check_lock(&self) -> bool {
        let Some(record) = self.load() else {
            return false;
        };
        if self.expired(&record) {
            self.reset();
            return false;
        }
        record.attempt_count >= MAX_FAILED_ATTEMPTS
    }

    /// Time until the lock clears, if currently locked.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        let record = self.load()?;
        if record.attempt_count < MAX_FAILED_ATTEMPTS || self.expired(&record) {
            return None;
        }
        let remaining = self.unlock_instant(&record) - self.clock.now().timestamp();
        Some(std::time::Duration::from_secs(remaining.max(0) as u64))
    }

    /// Records one failed sign-in and returns the updated attempt count.
    /// Emits a user-facing warning exactly when the count reaches the lock
    /// threshold.
    pub fn record_failure(&self) -> u32 {
        let record = match self.load() {
            Some(mut record) if !self.expired(&record) => {
                record.attempt_count += 1;
                record
            }
            _ => LockoutRecord {
                attempt_count: 1,
                first_failure_at: self.clock.now().timestamp(),
            },
        };
        if record.attempt_count == MAX_FAILED_ATTEMPTS {
            log::warn!(
                "sign-in locked for {LOCKOUT_MINUTES} minutes after {MAX_FAILED_ATTEMPTS} failed attempts"
            );
        }
        self.save(&record);
        record.attempt_count
    }

    /// Forces the clear state. Called on every successful authentication.
    pub fn reset(&self) {
        self.store.remove(LOCKOUT_KEY);
    }
}
