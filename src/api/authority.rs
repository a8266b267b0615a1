use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::api::types::{AuthChange, Session, SignUpOptions, User};
use crate::config::Config;
use crate::error::CoreError;

const CLIENT_INFO: &str = concat!("budgeteer-client/", env!("CARGO_PKG_VERSION"));
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Client-side view of the remote identity authority.
///
/// The authority verifies credentials and issues/refreshes sessions; this
/// crate never does either itself. Implementations must be cheap to share
/// behind an `Arc`.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, CoreError>;

    /// Registers a new user. The session is `None` when the authority
    /// requires email confirmation before issuing tokens.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<Option<Session>, CoreError>;

    /// Revalidates `current` with the authority. `Ok(None)` means the
    /// authority no longer recognizes the session.
    async fn get_session(&self, current: Option<&Session>) -> Result<Option<Session>, CoreError>;

    /// Exchanges a refresh token for fresh credentials. `Ok(None)` means the
    /// token was rejected and the user must sign in again.
    async fn refresh_session(&self, refresh_token: &str) -> Result<Option<Session>, CoreError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), CoreError>;

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn update_user_password(
        &self,
        access_token: &str,
        new_password: &str,
    ) -> Result<User, CoreError>;

    /// Redirect target for a third-party sign-in. The resulting session
    /// arrives later through the change stream, never as a return value.
    fn authorize_url(&self, provider: &str, redirect_to: &str) -> String;

    /// Asynchronous sign-in/sign-out notifications pushed by the authority.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}

/// reqwest client for a GoTrue-style identity endpoint.
pub struct RestAuthority {
    http: Client,
    base_url: String,
    anon_key: String,
    changes: broadcast::Sender<AuthChange>,
}

impl RestAuthority {
    pub fn new(config: &Config) -> Self {
        Self::new_with_base_url(config.identity_url(), config.anon_key.clone())
    }

    pub fn new_with_base_url(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            changes,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .header("apikey", &self.anon_key)
            .header("X-Client-Info", CLIENT_INFO)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .header("apikey", &self.anon_key)
            .header("X-Client-Info", CLIENT_INFO)
    }

    fn emit(&self, change: AuthChange) {
        // Nobody listening yet is fine; send only fails without receivers.
        let _ = self.changes.send(change);
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, CoreError> {
        let response = self
            .get("/user")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if status.is_success() {
            response.json::<User>().await.map_err(|err| {
                CoreError::Provider {
                    status: status.as_u16(),
                    message: format!("failed to parse user: {err}"),
                    code: None,
                }
            })
        } else {
            Err(error_from_response(status.as_u16(), &response.text().await.unwrap_or_default()))
        }
    }

    async fn parse_session(&self, response: Response) -> Result<Session, CoreError> {
        let status = response.status().as_u16();
        let value: Value = response.json().await.map_err(|err| CoreError::Provider {
            status,
            message: format!("failed to parse session: {err}"),
            code: None,
        })?;
        session_from_value(value)
    }

    /// Completes a redirect-based flow: parses the token fragment the
    /// authority appended to the redirect URL, fetches the user behind the
    /// token, and pushes the session through the change stream.
    pub async fn complete_redirect(&self, fragment: &str) -> Result<Session, CoreError> {
        let params: std::collections::HashMap<&str, &str> = fragment
            .trim_start_matches('#')
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let access_token = params
            .get("access_token")
            .ok_or_else(|| CoreError::Validation("redirect fragment has no access token".into()))?;
        let refresh_token = params.get("refresh_token").copied().unwrap_or_default();
        let expires_at = params
            .get("expires_at")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or_else(|| {
                let expires_in = params
                    .get("expires_in")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                Utc::now().timestamp() + expires_in
            });

        let user = self.fetch_user(access_token).await?;
        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            token_type: params.get("token_type").copied().unwrap_or("bearer").to_string(),
            expires_at,
            user,
        };
        self.emit(AuthChange::SignedIn(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl IdentityAuthority for RestAuthority {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, CoreError> {
        let response = self
            .post("/token?grant_type=password")
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if status.is_success() {
            let session = self.parse_session(response).await?;
            self.emit(AuthChange::SignedIn(session.clone()));
            Ok(session)
        } else {
            Err(error_from_response(
                status.as_u16(),
                &response.text().await.unwrap_or_default(),
            ))
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        options: SignUpOptions,
    ) -> Result<Option<Session>, CoreError> {
        let mut path = "/signup".to_string();
        if let Some(redirect_to) = &options.redirect_to {
            path.push_str(&format!(
                "?redirect_to={}",
                utf8_percent_encode(redirect_to, NON_ALPHANUMERIC)
            ));
        }
        let response = self
            .post(&path)
            .json(&json!({ "email": email, "password": password, "data": options.data }))
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(
                status.as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        let value: Value = response.json().await.map_err(|err| CoreError::Provider {
            status: status.as_u16(),
            message: format!("failed to parse sign-up response: {err}"),
            code: None,
        })?;
        // Confirmation-required flows answer with a bare user and no tokens.
        if value.get("access_token").is_none() {
            return Ok(None);
        }
        let session = session_from_value(value)?;
        self.emit(AuthChange::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn get_session(&self, current: Option<&Session>) -> Result<Option<Session>, CoreError> {
        let Some(current) = current else {
            return Ok(None);
        };
        match self.fetch_user(&current.access_token).await {
            Ok(user) => Ok(Some(Session {
                user,
                ..current.clone()
            })),
            Err(err) if err.is_authorization() => {
                self.refresh_session(&current.refresh_token).await
            }
            Err(err) => Err(err),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Option<Session>, CoreError> {
        let response = self
            .post("/token?grant_type=refresh_token")
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if status.is_success() {
            return Ok(Some(self.parse_session(response).await?));
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            log::warn!(
                "refresh token rejected by authority (status {})",
                status.as_u16()
            );
            return Ok(None);
        }
        Err(error_from_response(status.as_u16(), &body))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), CoreError> {
        let response = self
            .post("/logout")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(
                status.as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        self.emit(AuthChange::SignedOut);
        Ok(())
    }

    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut path = "/recover".to_string();
        if let Some(redirect_to) = redirect_to {
            path.push_str(&format!(
                "?redirect_to={}",
                utf8_percent_encode(redirect_to, NON_ALPHANUMERIC)
            ));
        }
        let response = self
            .post(&path)
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_from_response(
                status.as_u16(),
                &response.text().await.unwrap_or_default(),
            ))
        }
    }

    async fn update_user_password(
        &self,
        access_token: &str,
        new_password: &str,
    ) -> Result<User, CoreError> {
        let response = self
            .http
            .put(format!("{}/user", self.base_url))
            .header("apikey", &self.anon_key)
            .header("X-Client-Info", CLIENT_INFO)
            .bearer_auth(access_token)
            .json(&json!({ "password": new_password }))
            .send()
            .await
            .map_err(CoreError::from)?;
        let status = response.status();
        if status.is_success() {
            response.json::<User>().await.map_err(|err| {
                CoreError::Provider {
                    status: status.as_u16(),
                    message: format!("failed to parse user: {err}"),
                    code: None,
                }
            })
        } else {
            Err(error_from_response(
                status.as_u16(),
                &response.text().await.unwrap_or_default(),
            ))
        }
    }

    fn authorize_url(&self, provider: &str, redirect_to: &str) -> String {
        format!(
            "{}/authorize?provider={}&redirect_to={}",
            self.base_url,
            provider,
            utf8_percent_encode(redirect_to, NON_ALPHANUMERIC)
        )
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

/// Maps a non-success identity/database response to a typed error, pulling
/// the message and code out of the provider's loosely shaped error bodies.
pub(crate) fn error_from_response(status: u16, body: &str) -> CoreError {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = ["msg", "message", "error_description"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .or_else(|| value.get("error").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    let code = ["error_code", "error", "code"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    CoreError::Provider {
        status,
        message,
        code,
    }
}

fn session_from_value(value: Value) -> Result<Session, CoreError> {
    let expires_in = value.get("expires_in").and_then(Value::as_i64);
    let mut session: Session =
        serde_json::from_value(value).map_err(|err| CoreError::Provider {
            status: 200,
            message: format!("malformed session payload: {err}"),
            code: None,
        })?;
    if session.expires_at == 0 {
        session.expires_at = Utc::now().timestamp() + expires_in.unwrap_or(0);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn user_json(id: &str) -> Value {
        json!({
            "id": id,
            "email": format!("{id}@example.com"),
            "email_confirmed_at": null,
            "user_metadata": { "first_name": "Alice" }
        })
    }

    fn session_json(id: &str) -> Value {
        json!({
            "access_token": format!("token-{id}"),
            "refresh_token": format!("refresh-{id}"),
            "token_type": "bearer",
            "expires_in": 3600,
            "user": user_json(id)
        })
    }

    fn authority(server: &MockServer) -> RestAuthority {
        RestAuthority::new_with_base_url(server.url("/auth/v1"), "anon-key")
    }

    #[tokio::test]
    async fn sign_in_parses_session_and_emits_signed_in() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST)
                .path("/auth/v1/token")
                .header("apikey", "anon-key");
            then.status(200).json_body(session_json("u1"));
        });

        let authority = authority(&server);
        let mut changes = authority.subscribe();
        let session = authority
            .sign_in_with_password("u1@example.com", "pw")
            .await
            .unwrap();
        assert_eq!(session.access_token, "token-u1");
        assert!(session.expires_at > Utc::now().timestamp());
        assert!(matches!(
            changes.try_recv(),
            Ok(AuthChange::SignedIn(pushed)) if pushed.user.id == "u1"
        ));
    }

    #[tokio::test]
    async fn sign_in_failure_carries_provider_code() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/auth/v1/token");
            then.status(400).json_body(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            }));
        });

        let err = authority(&server)
            .sign_in_with_password("u1@example.com", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("invalid_grant"));
        assert_eq!(err.to_string(), "Invalid login credentials");
    }

    #[tokio::test]
    async fn sign_up_without_tokens_means_confirmation_pending() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/auth/v1/signup");
            then.status(200).json_body(user_json("u2"));
        });

        let session = authority(&server)
            .sign_up("u2@example.com", "pw", SignUpOptions::default())
            .await
            .unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn rejected_refresh_token_yields_none() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/auth/v1/token");
            then.status(400)
                .json_body(json!({ "error": "invalid_grant" }));
        });

        let refreshed = authority(&server)
            .refresh_session("stale-token")
            .await
            .unwrap();
        assert!(refreshed.is_none());
    }

    #[tokio::test]
    async fn get_session_revalidates_user_behind_the_cached_token() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET)
                .path("/auth/v1/user")
                .header("authorization", "Bearer token-u1");
            then.status(200).json_body(user_json("u1"));
        });

        let authority = authority(&server);
        let cached: Session = serde_json::from_value(session_json("u1")).unwrap();
        let current = authority.get_session(Some(&cached)).await.unwrap().unwrap();
        assert_eq!(current.user.id, "u1");
        assert_eq!(current.access_token, cached.access_token);

        assert!(authority.get_session(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_redirect_builds_a_session_from_the_fragment() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET)
                .path("/auth/v1/user")
                .header("authorization", "Bearer frag-token");
            then.status(200).json_body(user_json("u3"));
        });

        let authority = authority(&server);
        let mut changes = authority.subscribe();
        let session = authority
            .complete_redirect("#access_token=frag-token&refresh_token=frag-refresh&expires_at=9999999999&token_type=bearer")
            .await
            .unwrap();
        assert_eq!(session.user.id, "u3");
        assert_eq!(session.expires_at, 9_999_999_999);
        assert!(matches!(changes.try_recv(), Ok(AuthChange::SignedIn(_))));

        let err = authority.complete_redirect("#error=access_denied").await;
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[test]
    fn authorize_url_percent_encodes_the_redirect() {
        let authority = RestAuthority::new_with_base_url("http://id.local/auth/v1", "anon");
        let url = authority.authorize_url("google", "http://localhost:3000/callback");
        assert_eq!(
            url,
            "http://id.local/auth/v1/authorize?provider=google&redirect_to=http%3A%2F%2Flocalhost%3A3000%2Fcallback"
        );
    }

    #[test]
    fn error_from_response_survives_non_json_bodies() {
        let err = error_from_response(502, "<html>bad gateway</html>");
        assert_eq!(
            err,
            CoreError::Provider {
                status: 502,
                message: "request failed with status 502".into(),
                code: None,
            }
        );
    }
}
