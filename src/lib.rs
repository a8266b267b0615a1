//! Client-side core for the Budgeteer personal finance app.
//!
//! Owns the authentication and session lifecycle against a hosted identity
//! authority, rate limiting and retry for authenticated calls, and the
//! client for the financial data aggregator proxy. UI layers sit on top of
//! [`Core`] and never talk to the backend directly.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod store;
pub mod utils;

use std::sync::Arc;

use crate::api::aggregator::AggregatorClient;
use crate::api::authority::RestAuthority;
use crate::api::profiles::RestProfileStore;
pub use crate::api::guard::RequestGuard;
pub use crate::auth::gateway::AuthGateway;
pub use crate::auth::lockout::LockoutTracker;
pub use crate::auth::session::SessionManager;
pub use crate::config::Config;
pub use crate::error::CoreError;

use crate::store::secure::SecureStore;
use crate::store::session::SessionStore;
use crate::utils::clock::{system_clock, SharedClock};
use crate::utils::storage::SharedStorage;

/// Fully wired client core.
///
/// Construct once at startup with the platform's storage backend, spawn
/// [`Core::run_listener`], then call [`SessionManager::check_cached_session`]
/// to reconcile any persisted session.
pub struct Core {
    pub sessions: Arc<SessionManager>,
    pub auth: AuthGateway,
    pub guard: Arc<RequestGuard>,
    pub aggregator: AggregatorClient,
}

impl Core {
    pub fn new(config: &Config, storage: SharedStorage) -> Self {
        Self::new_with_clock(config, storage, system_clock())
    }

    pub fn new_with_clock(config: &Config, storage: SharedStorage, clock: SharedClock) -> Self {
        let secure = SecureStore::new(storage, clock.clone());
        let session_store = SessionStore::new(secure.clone(), clock.clone());
        let authority = Arc::new(RestAuthority::new(config));
        let profiles = Arc::new(RestProfileStore::new(config));
        let sessions = Arc::new(SessionManager::new(
            authority.clone(),
            session_store,
            clock.clone(),
        ));
        let guard = Arc::new(RequestGuard::new(sessions.clone(), clock.clone()));
        let aggregator = AggregatorClient::new(config, guard.clone());
        let auth = AuthGateway::new(
            authority,
            profiles,
            sessions.clone(),
            LockoutTracker::new(secure.clone(), clock),
            secure,
            config.site_url.clone(),
        );
        Self {
            sessions,
            auth,
            guard,
            aggregator,
        }
    }

    /// Drives pushed authority notifications into the session manager until
    /// the change stream closes.
    pub async fn run_listener(&self) {
        self.sessions.clone().run_listener().await;
    }
}
