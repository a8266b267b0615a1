use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated credential bundle issued by the identity authority.
///
/// Owned exclusively by the session manager; stores only serialize it and
/// UI code never mutates it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Seconds since the Unix epoch. The session is valid iff this is
    /// strictly in the future.
    #[serde(default)]
    pub expires_at: i64,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
}

impl User {
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.user_metadata
            .get(key)
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

/// One row in the external `profiles` table, created lazily the first time
/// an authenticated user without a row is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SignUpOptions {
    /// Arbitrary user metadata forwarded to the authority (first/last name,
    /// phone).
    pub data: Value,
    pub redirect_to: Option<String>,
}

/// Notification pushed asynchronously by the identity authority.
#[derive(Debug, Clone)]
pub enum AuthChange {
    SignedIn(Session),
    SignedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkToken {
    pub link_token: String,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedItem {
    pub item_id: String,
    #[serde(default)]
    pub institution_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub mask: Option<String>,
    pub balances: Balances,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    #[serde(default)]
    pub available: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    pub name: String,
    pub amount: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsSync {
    pub added: Vec<Transaction>,
    pub next_cursor: String,
    pub has_more: bool,
}

/// Result of a guarded fetch. `is_synthetic` is true when the data came from
/// the development fallback generator instead of the aggregator; consumers
/// must never present synthetic balances as real ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fetched<T> {
    pub data: T,
    #[serde(default)]
    pub is_synthetic: bool,
}

impl<T> Fetched<T> {
    pub fn real(data: T) -> Self {
        Self {
            data,
            is_synthetic: false,
        }
    }

    pub fn synthetic(data: T) -> Self {
        Self {
            data,
            is_synthetic: true,
        }
    }
}
