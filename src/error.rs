use std::time::Duration;

use thiserror::Error;

/// Stable error codes surfaced alongside user-facing messages.
pub mod codes {
    pub const ACCOUNT_LOCKED: &str = "ACCOUNT_LOCKED";
    pub const INVALID_CREDENTIALS: &str = "invalid_credentials";
    pub const EMAIL_NOT_CONFIRMED: &str = "email_not_confirmed";
    pub const USER_ALREADY_EXISTS: &str = "user_already_exists";
}

/// Error taxonomy for the client core.
///
/// Every public operation returns `Result<_, CoreError>` instead of
/// panicking or throwing; failures from collaborators are converted at the
/// boundary of each component.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Credential problems the user can fix: wrong password, unconfirmed
    /// email, locked account.
    #[error("{message}")]
    Authentication {
        message: String,
        code: Option<String>,
    },

    /// The current session is expired or could not be refreshed; recoverable
    /// by signing in again.
    #[error("session error: {0}")]
    Session(String),

    /// A guarded operation was attempted inside its cooldown window.
    #[error("rate limited, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Transport-level failure before any response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("{message}")]
    Provider {
        status: u16,
        message: String,
        code: Option<String>,
    },

    /// Rejected locally, before any network call was made.
    #[error("{0}")]
    Validation(String),
}

impl CoreError {
    pub fn authentication(message: impl Into<String>, code: impl Into<String>) -> Self {
        CoreError::Authentication {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The error returned while sign-in is suspended by the lockout tracker.
    pub fn locked(retry_after: Duration) -> Self {
        let minutes = retry_after.as_secs().div_ceil(60).max(1);
        CoreError::Authentication {
            message: format!(
                "Too many failed sign-in attempts. Try again in {minutes} minute(s)."
            ),
            code: Some(codes::ACCOUNT_LOCKED.to_string()),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            CoreError::Authentication { code, .. } | CoreError::Provider { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    /// Authorization-class failures are the ones a guarded call retries
    /// after forcing a session refresh.
    pub fn is_authorization(&self) -> bool {
        matches!(self, CoreError::Provider { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Network(err.to_string())
    }
}
