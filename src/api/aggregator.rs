use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::api::guard::{RequestGuard, DEFAULT_MAX_RETRIES};
use crate::api::synthetic;
use crate::api::types::{Account, Fetched, LinkToken, LinkedItem, Transaction, TransactionsSync};
use crate::config::Config;
use crate::error::CoreError;

/// Read cooldowns are short; sync is the expensive upstream call.
const READ_COOLDOWN: Duration = Duration::from_secs(5);
const SYNC_COOLDOWN: Duration = Duration::from_secs(30);

/// Client for the serverless proxy in front of the financial data
/// aggregator. Every call goes through the request guard for tokens,
/// retries and cooldowns.
///
/// With `offline_fallback` enabled, reads that fail for any reason other
/// than a local cooldown fall back to [`synthetic`] data, flagged as such.
pub struct AggregatorClient {
    http: Client,
    base_url: String,
    guard: Arc<RequestGuard>,
    offline_fallback: bool,
}

impl AggregatorClient {
    pub fn new(config: &Config, guard: Arc<RequestGuard>) -> Self {
        Self::new_with_base_url(config.functions_url(), guard, config.offline_fallback)
    }

    pub fn new_with_base_url(
        base_url: impl Into<String>,
        guard: Arc<RequestGuard>,
        offline_fallback: bool,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            guard,
            offline_fallback,
        }
    }

    async fn post_function<T: DeserializeOwned>(
        &self,
        function: &str,
        body: Value,
    ) -> Result<T, CoreError> {
        self.guard
            .call_authenticated(
                |token| {
                    let body = body.clone();
                    async move {
                        let response = self
                            .http
                            .post(format!("{}/{function}", self.base_url))
                            .bearer_auth(token)
                            .json(&body)
                            .send()
                            .await
                            .map_err(CoreError::from)?;
                        let status = response.status();
                        if !status.is_success() {
                            return Err(crate::api::authority::error_from_response(
                                status.as_u16(),
                                &response.text().await.unwrap_or_default(),
                            ));
                        }
                        response.json::<T>().await.map_err(|err| CoreError::Provider {
                            status: status.as_u16(),
                            message: format!("failed to parse {function} response: {err}"),
                            code: None,
                        })
                    }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
    }

    fn check_cooldown(&self, key: &str, cooldown: Duration) -> Result<(), CoreError> {
        if self.guard.can_call(key, cooldown) {
            Ok(())
        } else {
            Err(CoreError::RateLimited {
                retry_after: self
                    .guard
                    .retry_after(key, cooldown)
                    .unwrap_or(cooldown),
            })
        }
    }

    /// Wraps a read so that upstream failures degrade to synthetic data when
    /// the fallback is enabled. Cooldown rejections never degrade; the
    /// caller already has fresh-enough data.
    fn or_synthetic<T>(
        &self,
        result: Result<T, CoreError>,
        what: &str,
        placeholder: impl FnOnce() -> T,
    ) -> Result<Fetched<T>, CoreError> {
        match result {
            Ok(data) => Ok(Fetched::real(data)),
            Err(err @ CoreError::RateLimited { .. }) => Err(err),
            Err(err) if self.offline_fallback => {
                log::warn!("{what} unavailable, serving synthetic data: {err}");
                Ok(Fetched::synthetic(placeholder()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create_link_token(&self) -> Result<LinkToken, CoreError> {
        self.post_function("link-token", json!({})).await
    }

    pub async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<LinkedItem, CoreError> {
        self.post_function("exchange-token", json!({ "public_token": public_token }))
            .await
    }

    pub async fn list_accounts(&self) -> Result<Fetched<Vec<Account>>, CoreError> {
        self.check_cooldown("accounts", READ_COOLDOWN)?;
        let result = self.post_function("accounts", json!({})).await;
        self.or_synthetic(result, "accounts", synthetic::accounts)
    }

    pub async fn list_transactions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Fetched<Vec<Transaction>>, CoreError> {
        self.check_cooldown("transactions", READ_COOLDOWN)?;
        let result = self
            .post_function(
                "transactions",
                json!({ "start_date": start, "end_date": end }),
            )
            .await;
        self.or_synthetic(result, "transactions", || synthetic::transactions(start, end))
    }

    /// Cursor-based incremental sync. No synthetic fallback: a fake cursor
    /// would corrupt the caller's sync state.
    pub async fn sync_transactions(
        &self,
        cursor: Option<&str>,
    ) -> Result<TransactionsSync, CoreError> {
        self.check_cooldown("sync", SYNC_COOLDOWN)?;
        self.post_function("transactions-sync", json!({ "cursor": cursor }))
            .await
    }

    pub async fn remove_item(&self, item_id: &str) -> Result<(), CoreError> {
        let _: Value = self
            .post_function("remove-item", json!({ "item_id": item_id }))
            .await?;
        Ok(())
    }
}
