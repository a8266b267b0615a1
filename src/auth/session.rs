use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::error::RecvError;

use crate::api::authority::IdentityAuthority;
use crate::api::types::{AuthChange, Session, User};
use crate::store::session::SessionStore;
use crate::utils::clock::{Clock, SharedClock};

/// Owns the canonical in-memory session.
///
/// Every mutation, whether from a direct call or a pushed authority event,
/// funnels through [`SessionManager::update_session`]; nothing else writes
/// the session to memory or storage.
pub struct SessionManager {
    authority: Arc<dyn IdentityAuthority>,
    store: SessionStore,
    clock: SharedClock,
    current: RwLock<Option<Session>>,
}

impl SessionManager {
    pub fn new(
        authority: Arc<dyn IdentityAuthority>,
        store: SessionStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            authority,
            store,
            clock,
            current: RwLock::new(None),
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.current_session().map(|session| session.user)
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_valid(self.current_session().as_ref())
    }

    /// Startup reconciliation. Adopts a valid cached session immediately to
    /// avoid a loading flash, then asks the authority and overwrites memory
    /// and storage with its answer: the authority is always the source of
    /// truth, the cache only a latency optimization. A transport failure is
    /// not an answer, so the optimistic session survives it (logged).
    pub async fn check_cached_session(&self) -> Option<Session> {
        let cached = self.store.load();
        if self.store.is_valid(cached.as_ref()) {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.clone_from(&cached);
        }
        match self.authority.get_session(cached.as_ref()).await {
            Ok(answer) => self.update_session(answer),
            Err(err) => log::warn!("session check against authority failed: {err}"),
        }
        self.current_session()
    }

    /// Central mutation point. A session whose expiry is already in the past
    /// is normalized to `None` before it can reach memory or storage.
    pub fn update_session(&self, session: Option<Session>) {
        let now = self.clock.now().timestamp();
        let session = session.filter(|session| session.expires_at > now);
        self.store.save(session.as_ref());
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    /// Asks the authority for fresh tokens. Never fails loudly: a rejected
    /// or unreachable refresh is logged and reported as `None`, leaving
    /// re-login to the caller. Safe to call redundantly from concurrent
    /// sites; the last completed refresh wins.
    pub async fn refresh_session(&self) -> Option<Session> {
        let current = self.current_session()?;
        match self.authority.refresh_session(&current.refresh_token).await {
            Ok(session) => {
                self.update_session(session);
                self.current_session()
            }
            Err(err) => {
                log::warn!("session refresh failed: {err}");
                None
            }
        }
    }

    /// Applies one pushed authority notification through the same funnel as
    /// direct calls.
    pub fn apply_change(&self, change: AuthChange) {
        match change {
            AuthChange::SignedIn(session) => self.update_session(Some(session)),
            AuthChange::SignedOut => self.update_session(None),
        }
    }

    /// Drives the authority's notification stream until it closes. Spawn
    /// once at startup; redirect-based sign-ins land here.
    pub async fn run_listener(self: Arc<Self>) {
        let mut changes = self.authority.subscribe();
        loop {
            match changes.recv().await {
                Ok(change) => self.apply_change(change),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("auth change stream lagged, dropped {missed} event(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
