use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::utils::clock::{Clock, SharedClock};
use crate::utils::storage::SharedStorage;

pub(crate) const KEY_PREFIX: &str = "budgeteer.secure.";

#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

/// Obfuscated key/value persistence with optional expiry.
///
/// Values are base64-encoded before they hit the backing store. That is
/// obfuscation, not encryption: anyone with access to the browser profile
/// can decode them. Do not treat this store as a confidentiality boundary.
///
/// No operation ever surfaces an error. A failed write or an undecodable
/// entry is logged and treated as a no-op / absent value, so auth degrades
/// to "nothing cached" instead of crashing.
#[derive(Clone)]
pub struct SecureStore {
    storage: SharedStorage,
    clock: SharedClock,
}

impl SecureStore {
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self { storage, clock }
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    pub fn save(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = CachedEntry {
            payload: STANDARD.encode(value),
            expires_at: ttl.map(|ttl| (self.clock.now() + ttl).timestamp()),
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(err) => {
                log::warn!("secure store: failed to encode entry for {key}: {err}");
                return;
            }
        };
        if let Err(err) = self.storage.set_item(&Self::namespaced(key), &encoded) {
            log::warn!("secure store: failed to persist {key}: {err}");
        }
    }

    /// Returns the decoded value, or `None` after evicting an expired or
    /// undecodable entry.
    pub fn get(&self, key: &str) -> Option<String> {
        let raw = match self.storage.get_item(&Self::namespaced(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("secure store: failed to read {key}: {err}");
                return None;
            }
        };
        let entry: CachedEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("secure store: evicting undecodable entry {key}: {err}");
                self.remove(key);
                return None;
            }
        };
        if let Some(expires_at) = entry.expires_at {
            if self.clock.now().timestamp() >= expires_at {
                self.remove(key);
                return None;
            }
        }
        let decoded = STANDARD
            .decode(&entry.payload)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        match decoded {
            Some(value) => Some(value),
            None => {
                log::warn!("secure store: evicting entry {key} with corrupt payload");
                self.remove(key);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(err) = self.storage.remove_item(&Self::namespaced(key)) {
            log::warn!("secure store: failed to remove {key}: {err}");
        }
    }

    /// Drops every namespaced entry. Sign-out uses this so local state never
    /// outlives the authority's view of the session.
    pub fn clear(&self) {
        for key in self.storage.keys() {
            if key.starts_with(KEY_PREFIX) {
                if let Err(err) = self.storage.remove_item(&key) {
                    log::warn!("secure store: failed to clear {key}: {err}");
                }
            }
        }
    }
}
