use std::sync::Arc;

use serde_json::Value;

use crate::api::authority::IdentityAuthority;
use crate::api::profiles::ProfileStore;
use crate::api::types::{Profile, Session, SignUpOptions};
use crate::auth::lockout::LockoutTracker;
use crate::auth::session::SessionManager;
use crate::error::{codes, CoreError};
use crate::store::secure::SecureStore;

/// Credential operations: sign-in/up/out and password maintenance.
///
/// Consults the lockout tracker before every sign-in attempt and records
/// outcomes into it; adopted sessions always flow through the session
/// manager's single mutation funnel.
pub struct AuthGateway {
    authority: Arc<dyn IdentityAuthority>,
    profiles: Arc<dyn ProfileStore>,
    sessions: Arc<SessionManager>,
    lockout: LockoutTracker,
    secure: SecureStore,
    redirect_url: String,
}

impl AuthGateway {
    pub fn new(
        authority: Arc<dyn IdentityAuthority>,
        profiles: Arc<dyn ProfileStore>,
        sessions: Arc<SessionManager>,
        lockout: LockoutTracker,
        secure: SecureStore,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            profiles,
            sessions,
            lockout,
            secure,
            redirect_url: redirect_url.into(),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, CoreError> {
        if self.lockout.check_lock() {
            let retry_after = self.lockout.retry_after().unwrap_or_default();
            return Err(CoreError::locked(retry_after));
        }
        match self.authority.sign_in_with_password(email, password).await {
            Ok(session) => {
                self.lockout.reset();
                self.ensure_profile(&session).await;
                self.sessions.update_session(Some(session.clone()));
                Ok(session)
            }
            Err(err) => {
                self.lockout.record_failure();
                Err(map_sign_in_error(err))
            }
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<Option<Session>, CoreError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(CoreError::Validation(
                "Email and password are required".into(),
            ));
        }
        let options = SignUpOptions {
            data: metadata,
            redirect_to: Some(self.redirect_url.clone()),
        };
        match self.authority.sign_up(email, password, options).await {
            Ok(session) => {
                if let Some(session) = &session {
                    self.sessions.update_session(Some(session.clone()));
                }
                Ok(session)
            }
            Err(err) => Err(map_sign_up_error(err)),
        }
    }

    /// Signs out with the authority, then clears all local secure storage
    /// whether or not that call succeeded: local state must never outlive
    /// the authority's knowledge of the session.
    pub async fn sign_out(&self) -> Result<(), CoreError> {
        if let Some(session) = self.sessions.current_session() {
            if let Err(err) = self.authority.sign_out(&session.access_token).await {
                log::warn!("authority sign-out failed, clearing local state anyway: {err}");
            }
        }
        self.secure.clear();
        self.sessions.update_session(None);
        Ok(())
    }

    pub async fn reset_password(&self, email: &str) -> Result<(), CoreError> {
        if email.trim().is_empty() {
            return Err(CoreError::Validation("Email is required".into()));
        }
        self.authority
            .reset_password_for_email(email, Some(&self.redirect_url))
            .await
    }

    pub async fn update_password(&self, new_password: &str) -> Result<(), CoreError> {
        let session = self
            .sessions
            .current_session()
            .ok_or_else(|| CoreError::Session("not signed in".into()))?;
        self.authority
            .update_user_password(&session.access_token, new_password)
            .await?;
        // The credential change may rotate the token; pull the fresh session.
        self.sessions.refresh_session().await;
        Ok(())
    }

    /// Starts a redirect-based third-party sign-in. No local state changes
    /// here; the eventual session arrives through the authority's change
    /// stream into the session manager.
    pub fn sign_in_with_google(&self) -> String {
        self.authority.authorize_url("google", &self.redirect_url)
    }

    /// Creates the user's profile row on first sight of an authenticated
    /// user without one. Sign-in does not fail on a profile error; the row
    /// is retried on the next sign-in.
    async fn ensure_profile(&self, session: &Session) {
        let user = &session.user;
        match self.profiles.fetch(&session.access_token, &user.id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let profile = Profile {
                    id: user.id.clone(),
                    email: user.email.clone(),
                    first_name: user.metadata_str("first_name"),
                    last_name: user.metadata_str("last_name"),
                    phone: user.metadata_str("phone"),
                };
                if let Err(err) = self.profiles.insert(&session.access_token, &profile).await {
                    log::warn!("failed to create profile for {}: {err}", user.id);
                }
            }
            Err(err) => log::warn!("profile lookup failed for {}: {err}", user.id),
        }
    }
}

/// Rewrites generic provider sign-in failures into user-facing messages.
fn map_sign_in_error(err: CoreError) -> CoreError {
    match err.code() {
        Some(codes::INVALID_CREDENTIALS) | Some("invalid_grant") => {
            CoreError::authentication("Invalid email or password", codes::INVALID_CREDENTIALS)
        }
        Some(codes::EMAIL_NOT_CONFIRMED) => CoreError::authentication(
            "Please confirm your email address before signing in",
            codes::EMAIL_NOT_CONFIRMED,
        ),
        _ => err,
    }
}

fn map_sign_up_error(err: CoreError) -> CoreError {
    let already_registered = matches!(err.code(), Some(codes::USER_ALREADY_EXISTS))
        || matches!(err, CoreError::Provider { status: 422, .. });
    if already_registered {
        CoreError::authentication(
            "This email is already registered. Try signing in instead.",
            codes::USER_ALREADY_EXISTS,
        )
    } else {
        err
    }
}
