use chrono::Duration;

use crate::api::types::Session;
use crate::store::secure::SecureStore;
use crate::utils::clock::{Clock, SharedClock};

const SESSION_KEY: &str = "auth.session";

/// Cached sessions older than this are dropped by the secure store even if
/// the token inside claims a later expiry.
const SESSION_CACHE_TTL_HOURS: i64 = 24;

/// Typed wrapper over [`SecureStore`] for the current session.
#[derive(Clone)]
pub struct SessionStore {
    store: SecureStore,
    clock: SharedClock,
}

impl SessionStore {
    pub fn new(store: SecureStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// `None` removes the cached session; `Some` overwrites it with the
    /// process-wide cache TTL.
    pub fn save(&self, session: Option<&Session>) {
        match session {
            None => self.store.remove(SESSION_KEY),
            Some(session) => match serde_json::to_string(session) {
                Ok(json) => self.store.save(
                    SESSION_KEY,
                    &json,
                    Some(Duration::hours(SESSION_CACHE_TTL_HOURS)),
                ),
                Err(err) => log::warn!("session store: failed to serialize session: {err}"),
            },
        }
    }

    /// Never returns a malformed session: parse failures evict the entry.
    pub fn load(&self) -> Option<Session> {
        let raw = self.store.get(SESSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                log::warn!("session store: evicting malformed cached session: {err}");
                self.store.remove(SESSION_KEY);
                None
            }
        }
    }

    /// Strictly-future expiry; a session expiring exactly now is invalid.
    pub fn is_valid(&self, session: Option<&Session>) -> bool {
        session.is_some_and(|session| session.expires_at > self.clock.now().timestamp())
    }
}
