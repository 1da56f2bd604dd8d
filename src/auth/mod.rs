//! App access token lifecycle: validate, mint via client credentials, persist.

use crate::config::ConfigStore;
use crate::error::FatalError;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum MintError {
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {message}")]
    Rejected {
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("token response is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("token response contained no access_token")]
    MissingToken,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    message: Option<String>,
}

pub struct TokenManager {
    config: Arc<ConfigStore>,
    client: Client,
}

impl TokenManager {
    pub fn new(config: Arc<ConfigStore>, client: Client) -> Self {
        Self { config, client }
    }

    fn id_url(&self, path: &str) -> String {
        let base = self.config.current().twitch.id_base_url.clone();
        format!("{}{path}", base.trim_end_matches('/'))
    }

    /// Ask the identity service whether `token` belongs to our client id.
    ///
    /// Fails closed: any transport or parse error counts as invalid.
    pub async fn verify(&self, token: &str) -> bool {
        if token.trim().is_empty() {
            tracing::debug!("No token to validate");
            return false;
        }

        let expected_client_id = self.config.current().twitch.client_id.clone();
        let result = async {
            let response = self
                .client
                .get(self.id_url("/oauth2/validate"))
                .header("Authorization", format!("OAuth {token}"))
                .send()
                .await?;
            let body = response.text().await?;
            anyhow::Ok(serde_json::from_str::<ValidateResponse>(&body)?)
        }
        .await;

        let valid = match result {
            Ok(validated) => {
                let valid = validated.client_id.as_deref() == Some(expected_client_id.as_str());
                if let (true, Some(expires_in)) = (valid, validated.expires_in) {
                    tracing::debug!(expires_in, "Token validated");
                }
                valid
            }
            Err(e) => {
                tracing::error!("Error validating token: {e:#}");
                false
            }
        };
        tracing::debug!(valid, "Token validation finished");
        valid
    }

    /// Exchange the client credentials for a fresh app access token.
    pub async fn mint(&self) -> Result<String, MintError> {
        let config = self.config.current();
        let form = [
            ("client_id", config.twitch.client_id.as_str()),
            ("client_secret", config.twitch.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .client
            .post(self.id_url("/oauth2/token"))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<OAuthErrorResponse>(&body)
                .ok()
                .and_then(|err| err.message)
                .unwrap_or(body);
            return Err(MintError::Rejected { status, message });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        if let Some(expires_in) = token.expires_in {
            tracing::debug!(expires_in, "Minted new app access token");
        }
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(MintError::MissingToken)
    }

    /// Startup protocol: reuse the stored token if it validates, otherwise
    /// mint, re-validate and persist a new one.
    pub async fn ensure_valid_token(&self) -> Result<String, FatalError> {
        tracing::info!("Checking if last token is valid...");
        let stored = self.config.current().twitch.last_token.clone();
        if self.verify(&stored).await {
            tracing::info!("Token was valid, reusing!");
            return Ok(stored);
        }

        tracing::info!("Token was invalid, generating new one...");
        let fresh = self.mint().await.map_err(|e| {
            tracing::error!("Error generating new token: {e}");
            FatalError::TokenUnusable(e.to_string())
        })?;

        if !self.verify(&fresh).await {
            tracing::error!("Freshly generated token not valid. ABORTING STARTUP");
            return Err(FatalError::TokenUnusable(
                "freshly minted token failed validation".into(),
            ));
        }

        self.install(&fresh).await.map_err(FatalError::Startup)?;
        Ok(fresh)
    }

    /// Re-validate the current token once, replacing it if it went bad.
    ///
    /// Returns `true` when a new token was installed.
    pub async fn revalidate(&self) -> anyhow::Result<bool> {
        let current = self.config.current().twitch.last_token.clone();
        if self.verify(&current).await {
            return Ok(false);
        }

        tracing::warn!("App access token no longer valid, minting a new one");
        let fresh = self.mint().await?;
        if !self.verify(&fresh).await {
            anyhow::bail!("freshly minted token failed validation");
        }
        self.install(&fresh).await?;
        Ok(true)
    }

    /// Run [`TokenManager::revalidate`] every `interval` until the task is aborted.
    pub fn spawn_revalidation(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; startup already validated.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.revalidate().await {
                    Ok(true) => tracing::info!("App access token rotated"),
                    Ok(false) => tracing::debug!("App access token still valid"),
                    Err(e) => tracing::error!("Token revalidation failed: {e:#}"),
                }
            }
        })
    }

    async fn install(&self, token: &str) -> anyhow::Result<()> {
        self.config
            .update(|cfg| cfg.twitch.last_token = token.to_owned());
        self.config.persist().await
    }
}
