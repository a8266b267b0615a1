use async_trait::async_trait;
use reqwest::Client;

use crate::api::authority::error_from_response;
use crate::api::types::Profile;
use crate::config::Config;
use crate::error::CoreError;

/// Access to the external `profiles` table, one row per user identity.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch(&self, access_token: &str, user_id: &str)
        -> Result<Option<Profile>, CoreError>;
    async fn insert(&self, access_token: &str, profile: &Profile) -> Result<(), CoreError>;
}

/// PostgREST-style client for the hosted database.
pub struct RestProfileStore {
    http: Client,
    base_url: String,
    anon_key: String,
}

impl RestProfileStore {
    pub fn new(config: &Config) -> Self {
        Self::new_with_base_url(config.rest_url(), config.anon_key.clone())
    }

    pub fn new_with_base_url(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            anon_key: anon_key.into(),
        }
    }
}

#[async_trait]
impl ProfileStore for RestProfileStore {
    async fn fetch(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Option<Profile>, CoreError> {
        let response = self
            .http
            .get(format!("{}/profiles", self.base_url))
            .query(&[("id", format!("eq.{user_id}")), ("select", "*".to_string())])
            .header("apikey", &self.anon_key)
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
        let mut rows: Vec<Profile> =
            response.json().await.map_err(|err| CoreError::Provider {
                status: status.as_u16(),
                message: format!("failed to parse profiles: {err}"),
                code: None,
            })?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn insert(&self, access_token: &str, profile: &Profile) -> Result<(), CoreError> {
        let response = self
            .http
            .post(format!("{}/profiles", self.base_url))
            .header("apikey", &self.anon_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(access_token)
            .json(profile)
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
}
