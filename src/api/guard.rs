use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth::session::SessionManager;
use crate::error::CoreError;
use crate::utils::clock::{Clock, SharedClock};

/// Tokens this close to expiry are refreshed before being handed out.
pub const REFRESH_MARGIN_SECS: i64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Front door for every authenticated outbound call.
///
/// Hands callers a token that is valid for at least the refresh margin,
/// retries authorization failures once per forced refresh, and throttles
/// named operations with per-key cooldowns.
pub struct RequestGuard {
    sessions: Arc<SessionManager>,
    clock: SharedClock,
    last_call: Mutex<HashMap<String, DateTime<Utc>>>,
    backoff_base: Duration,
}

impl RequestGuard {
    pub fn new(sessions: Arc<SessionManager>, clock: SharedClock) -> Self {
        Self {
            sessions,
            clock,
            last_call: Mutex::new(HashMap::new()),
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Shrinks the retry backoff. Test hook; the default is one second.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Check-and-set rate limit for a named operation. Returns `true` and
    /// marks the key as called when the cooldown has fully elapsed; a denied
    /// call leaves the previous marker untouched.
    pub fn can_call(&self, key: &str, cooldown: Duration) -> bool {
        let now = self.clock.now();
        let mut last_call = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last_call.get(key) {
            let elapsed = (now - *last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < cooldown {
                return false;
            }
        }
        last_call.insert(key.to_string(), now);
        true
    }

    /// Remaining cooldown for a key, if any.
    pub fn retry_after(&self, key: &str, cooldown: Duration) -> Option<Duration> {
        let last_call = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        let last = last_call.get(key)?;
        let elapsed = (self.clock.now() - *last).to_std().unwrap_or(Duration::ZERO);
        cooldown.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    /// A token guaranteed valid for at least the refresh margin, refreshing
    /// proactively when the current one is about to lapse.
    async fn fresh_token(&self) -> Result<String, CoreError> {
        let session = self
            .sessions
            .current_session()
            .ok_or_else(|| CoreError::Session("not signed in".into()))?;
        if session.expires_at - self.clock.now().timestamp() > REFRESH_MARGIN_SECS {
            return Ok(session.access_token);
        }
        self.sessions
            .refresh_session()
            .await
            .map(|fresh| fresh.access_token)
            .ok_or_else(|| CoreError::Session("session expired and refresh failed".into()))
    }

    /// Runs `op` with a fresh access token. An authorization failure forces
    /// a session refresh and one retry per remaining attempt, with
    /// exponential backoff between attempts; any other error is returned
    /// as-is.
    pub async fn call_authenticated<T, F, Fut>(
        &self,
        op: F,
        max_retries: u32,
    ) -> Result<T, CoreError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            let token = self.fresh_token().await?;
            match op(token).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_authorization() && attempt < max_retries => {
                    attempt += 1;
                    log::warn!("authenticated call rejected, refreshing and retrying (attempt {attempt})");
                    if self.sessions.refresh_session().await.is_none() {
                        return Err(CoreError::Session(
                            "session rejected and refresh failed".into(),
                        ));
                    }
                    tokio::time::sleep(self.backoff_base * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{session_expiring_at, MockAuthority};
    use crate::store::secure::SecureStore;
    use crate::store::session::SessionStore;
    use crate::utils::clock::ManualClock;
    use crate::utils::storage::MemoryStorage;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        authority: Arc<MockAuthority>,
        sessions: Arc<SessionManager>,
        guard: RequestGuard,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        let clock = ManualClock::at(Utc::now());
        let secure = SecureStore::new(storage, clock.clone());
        let store = SessionStore::new(secure, clock.clone());
        let authority = MockAuthority::new();
        let sessions = Arc::new(SessionManager::new(
            authority.clone(),
            store,
            clock.clone(),
        ));
        let guard = RequestGuard::new(sessions.clone(), clock.clone())
            .with_backoff_base(Duration::from_millis(1));
        Fixture {
            authority,
            sessions,
            guard,
            clock,
        }
    }

    fn sign_in(f: &Fixture, id: &str, expires_in_secs: i64) {
        let session = session_expiring_at(id, f.clock.now().timestamp() + expires_in_secs);
        f.sessions.update_session(Some(session));
    }

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let f = fixture();
        let cooldown = Duration::from_secs(5);
        assert!(f.guard.can_call("sync", cooldown));
        assert!(!f.guard.can_call("sync", cooldown));

        f.clock.advance(chrono::Duration::milliseconds(4999));
        assert!(!f.guard.can_call("sync", cooldown));

        f.clock.advance(chrono::Duration::milliseconds(1));
        assert!(f.guard.can_call("sync", cooldown));
        // The granted call re-armed the cooldown.
        assert!(!f.guard.can_call("sync", cooldown));
    }

    #[test]
    fn cooldowns_are_tracked_per_key() {
        let f = fixture();
        let cooldown = Duration::from_secs(5);
        assert!(f.guard.can_call("sync", cooldown));
        assert!(f.guard.can_call("accounts", cooldown));
        assert!(!f.guard.can_call("sync", cooldown));
    }

    #[test]
    fn denied_calls_do_not_extend_the_cooldown() {
        let f = fixture();
        let cooldown = Duration::from_secs(5);
        assert!(f.guard.can_call("sync", cooldown));
        f.clock.advance(chrono::Duration::seconds(3));
        assert!(!f.guard.can_call("sync", cooldown));
        f.clock.advance(chrono::Duration::seconds(2));
        assert!(f.guard.can_call("sync", cooldown));
    }

    #[test]
    fn retry_after_reports_the_remaining_cooldown() {
        let f = fixture();
        let cooldown = Duration::from_secs(5);
        assert_eq!(f.guard.retry_after("sync", cooldown), None);
        assert!(f.guard.can_call("sync", cooldown));
        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(
            f.guard.retry_after("sync", cooldown),
            Some(Duration::from_secs(3))
        );
        f.clock.advance(chrono::Duration::seconds(3));
        assert_eq!(f.guard.retry_after("sync", cooldown), None);
    }

    #[tokio::test]
    async fn authorization_failure_refreshes_once_and_retries() {
        let f = fixture();
        sign_in(&f, "u1", 3600);
        f.authority
            .set_refresh(Some(session_expiring_at("u1-fresh", f.clock.now().timestamp() + 3600)));

        let calls = AtomicUsize::new(0);
        let result = f
            .guard
            .call_authenticated(
                |token| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            Err(CoreError::Provider {
                                status: 401,
                                message: "jwt expired".into(),
                                code: None,
                            })
                        } else {
                            Ok(token)
                        }
                    }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.authority.refresh_calls(), 1);
        assert_eq!(result, "token-u1-fresh");
    }

    #[tokio::test]
    async fn non_authorization_errors_are_not_retried() {
        let f = fixture();
        sign_in(&f, "u1", 3600);

        let calls = AtomicUsize::new(0);
        let err = f
            .guard
            .call_authenticated(
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(CoreError::Provider {
                            status: 500,
                            message: "boom".into(),
                            code: None,
                        })
                    }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, CoreError::Provider { status: 500, .. }));
        assert_eq!(f.authority.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn persistent_rejection_exhausts_the_retry_budget() {
        let f = fixture();
        sign_in(&f, "u1", 3600);
        f.authority
            .set_refresh(Some(session_expiring_at("u1", f.clock.now().timestamp() + 3600)));

        let calls = AtomicUsize::new(0);
        let err = f
            .guard
            .call_authenticated(
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(CoreError::Provider {
                            status: 403,
                            message: "forbidden".into(),
                            code: None,
                        })
                    }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1 + DEFAULT_MAX_RETRIES as usize);
        assert!(err.is_authorization());
    }

    #[tokio::test]
    async fn near_expiry_tokens_are_refreshed_before_the_call() {
        let f = fixture();
        sign_in(&f, "u1", REFRESH_MARGIN_SECS - 10);
        f.authority
            .set_refresh(Some(session_expiring_at("u1-fresh", f.clock.now().timestamp() + 3600)));

        let token = f
            .guard
            .call_authenticated(|token| async move { Ok::<_, CoreError>(token) }, 0)
            .await
            .unwrap();
        assert_eq!(token, "token-u1-fresh");
        assert_eq!(f.authority.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn failed_proactive_refresh_never_invokes_the_operation() {
        let f = fixture();
        sign_in(&f, "u1", 60);
        f.authority.fail_refresh();

        let calls = AtomicUsize::new(0);
        let err = f
            .guard
            .call_authenticated(
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), CoreError>(()) }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, CoreError::Session(_)));
    }

    #[tokio::test]
    async fn calls_without_a_session_fail_fast() {
        let f = fixture();
        let err = f
            .guard
            .call_authenticated(|_token| async { Ok::<(), CoreError>(()) }, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Session(_)));
    }
}
