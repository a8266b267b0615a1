//! Programmable in-memory collaborators shared across unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use crate::api::authority::IdentityAuthority;
use crate::api::profiles::ProfileStore;
use crate::api::types::{AuthChange, Profile, Session, SignUpOptions, User};
use crate::error::CoreError;

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        email_confirmed_at: None,
        user_metadata: json!({ "first_name": "Alice" }),
    }
}

pub fn session_expiring_at(id: &str, expires_at: i64) -> Session {
    Session {
        access_token: format!("token-{id}"),
        refresh_token: format!("refresh-{id}"),
        token_type: "bearer".to_string(),
        expires_at,
        user: user(id),
    }
}

fn transport_down() -> CoreError {
    CoreError::Network("connection refused".into())
}

/// Scripted identity authority. Results are set up front; calls are counted.
pub struct MockAuthority {
    sign_in_result: Mutex<Result<Session, CoreError>>,
    sign_up_result: Mutex<Result<Option<Session>, CoreError>>,
    session_result: Mutex<Result<Option<Session>, CoreError>>,
    refresh_result: Mutex<Result<Option<Session>, CoreError>>,
    sign_out_ok: Mutex<bool>,
    sign_in_calls: AtomicUsize,
    sign_up_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    changes: broadcast::Sender<AuthChange>,
}

impl MockAuthority {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(16);
        Arc::new(Self {
            sign_in_result: Mutex::new(Err(transport_down())),
            sign_up_result: Mutex::new(Ok(None)),
            session_result: Mutex::new(Ok(None)),
            refresh_result: Mutex::new(Ok(None)),
            sign_out_ok: Mutex::new(true),
            sign_in_calls: AtomicUsize::new(0),
            sign_up_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            changes,
        })
    }

    pub fn set_sign_in(&self, result: Result<Session, CoreError>) {
        *self.sign_in_result.lock().unwrap() = result;
    }

    pub fn set_sign_up(&self, session: Option<Session>) {
        *self.sign_up_result.lock().unwrap() = Ok(session);
    }

    pub fn fail_sign_up(&self, err: CoreError) {
        *self.sign_up_result.lock().unwrap() = Err(err);
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session_result.lock().unwrap() = Ok(session);
    }

    pub fn fail_get_session(&self) {
        *self.session_result.lock().unwrap() = Err(transport_down());
    }

    pub fn set_refresh(&self, session: Option<Session>) {
        *self.refresh_result.lock().unwrap() = Ok(session);
    }

    pub fn fail_refresh(&self) {
        *self.refresh_result.lock().unwrap() = Err(transport_down());
    }

    pub fn fail_sign_out(&self) {
        *self.sign_out_ok.lock().unwrap() = false;
    }

    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub fn sign_up_calls(&self) -> usize {
        self.sign_up_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn emit(&self, change: AuthChange) {
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl IdentityAuthority for MockAuthority {
    async fn sign_in_with_password(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<Session, CoreError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_in_result.lock().unwrap().clone()
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _options: SignUpOptions,
    ) -> Result<Option<Session>, CoreError> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_up_result.lock().unwrap().clone()
    }

    async fn get_session(&self, _current: Option<&Session>) -> Result<Option<Session>, CoreError> {
        self.session_result.lock().unwrap().clone()
    }

    async fn refresh_session(&self, _refresh_token: &str) -> Result<Option<Session>, CoreError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_result.lock().unwrap().clone()
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), CoreError> {
        if *self.sign_out_ok.lock().unwrap() {
            Ok(())
        } else {
            Err(transport_down())
        }
    }

    async fn reset_password_for_email(
        &self,
        _email: &str,
        _redirect_to: Option<&str>,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn update_user_password(
        &self,
        _access_token: &str,
        _new_password: &str,
    ) -> Result<User, CoreError> {
        Ok(user("u1"))
    }

    fn authorize_url(&self, provider: &str, redirect_to: &str) -> String {
        format!("http://id.local/authorize?provider={provider}&redirect_to={redirect_to}")
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

/// In-memory profile table.
pub struct MockProfiles {
    rows: Mutex<Vec<Profile>>,
    insert_calls: AtomicUsize,
}

impl MockProfiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            insert_calls: AtomicUsize::new(0),
        })
    }

    pub fn rows(&self) -> Vec<Profile> {
        self.rows.lock().unwrap().clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for MockProfiles {
    async fn fetch(
        &self,
        _access_token: &str,
        user_id: &str,
    ) -> Result<Option<Profile>, CoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|profile| profile.id == user_id)
            .cloned())
    }

    async fn insert(&self, _access_token: &str, profile: &Profile) -> Result<(), CoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().push(profile.clone());
        Ok(())
    }
}
