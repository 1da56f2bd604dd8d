//! Helix API client for the conduit endpoints and chat replies.
//!
//! Every request reads the current token and client id from the shared
//! [`ConfigStore`], so a token refresh is picked up without rebuilding the
//! client.

pub mod types;

pub use types::{
    Conduit, HelixList, Shard, ShardPage, ShardStatus, ShardTransport, WebhookTransport,
    WEBHOOK_METHOD,
};

use crate::config::ConfigStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use types::ShardUpdateResponse;

/// Upstream conduit primitives the shard reconciler needs.
#[async_trait]
pub trait ConduitApi: Send + Sync {
    /// `GET /eventsub/conduits`: every conduit owned by this client id.
    async fn list_conduits(&self) -> Result<Vec<Conduit>>;

    /// One page of `GET /eventsub/conduits/shards`.
    async fn list_shards(&self, conduit_id: &str, after: Option<&str>) -> Result<ShardPage>;

    /// `POST /eventsub/conduits`.
    async fn create_conduit(&self, shard_count: u32) -> Result<Conduit>;

    /// `PATCH /eventsub/conduits`: set a conduit's capacity.
    async fn set_shard_count(&self, conduit_id: &str, shard_count: u32) -> Result<Conduit>;

    /// `PATCH /eventsub/conduits/shards`: point one shard at a webhook.
    async fn set_shard_transport(
        &self,
        conduit_id: &str,
        shard_id: u32,
        transport: &WebhookTransport,
    ) -> Result<()>;
}

/// Build the shared reqwest client with the configured upstream timeout.
pub fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .context("Failed to build HTTP client")
}

pub struct HelixClient {
    config: Arc<ConfigStore>,
    client: Client,
}

impl HelixClient {
    pub fn new(config: Arc<ConfigStore>, client: Client) -> Self {
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.current().twitch.api_base_url.clone();
        format!("{}{path}", base.trim_end_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let config = self.config.current();
        builder
            .bearer_auth(&config.twitch.last_token)
            .header("Client-Id", &config.twitch.client_id)
    }

    /// Post `message` into `broadcaster_id`'s chat as `sender_id`, threaded
    /// under `reply_parent_message_id` when given.
    pub async fn send_chat_message(
        &self,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
        reply_parent_message_id: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "broadcaster_id": broadcaster_id,
            "sender_id": sender_id,
            "message": message,
        });
        if let Some(parent) = reply_parent_message_id {
            body["reply_parent_message_id"] = serde_json::Value::String(parent.to_owned());
        }

        let response = self
            .authorized(self.client.post(self.url("/chat/messages")))
            .json(&body)
            .send()
            .await
            .context("Failed to send chat message request")?;
        let body: serde_json::Value = read_success_json(response, "chat message").await?;

        let dropped = body
            .pointer("/data/0/is_sent")
            .and_then(serde_json::Value::as_bool)
            == Some(false);
        if dropped {
            let reason = body
                .pointer("/data/0/drop_reason/message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown reason");
            anyhow::bail!("Twitch dropped chat message: {reason}");
        }
        Ok(())
    }
}

/// Read a response body, failing with status and body text on non-2xx.
async fn read_success_json<T: serde::de::DeserializeOwned>(
    response: Response,
    what: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read {what} response body"))?;

    if !status.is_success() {
        anyhow::bail!("Helix {what} request failed ({status}): {body}");
    }

    serde_json::from_str(&body).with_context(|| format!("Failed to parse {what} response"))
}

#[async_trait]
impl ConduitApi for HelixClient {
    async fn list_conduits(&self) -> Result<Vec<Conduit>> {
        let response = self
            .authorized(self.client.get(self.url("/eventsub/conduits")))
            .send()
            .await
            .context("Failed to send conduit list request")?;
        let list: HelixList<Conduit> = read_success_json(response, "conduit list").await?;
        Ok(list.data)
    }

    async fn list_shards(&self, conduit_id: &str, after: Option<&str>) -> Result<ShardPage> {
        let mut query = vec![("conduit_id", conduit_id)];
        if let Some(cursor) = after {
            query.push(("after", cursor));
        }
        let response = self
            .authorized(self.client.get(self.url("/eventsub/conduits/shards")))
            .query(&query)
            .send()
            .await
            .context("Failed to send shard list request")?;
        let list: HelixList<Shard> = read_success_json(response, "shard list").await?;
        Ok(ShardPage {
            shards: list.data,
            cursor: list.pagination.cursor.filter(|c| !c.is_empty()),
        })
    }

    async fn create_conduit(&self, shard_count: u32) -> Result<Conduit> {
        let response = self
            .authorized(self.client.post(self.url("/eventsub/conduits")))
            .json(&serde_json::json!({ "shard_count": shard_count }))
            .send()
            .await
            .context("Failed to send conduit create request")?;
        let list: HelixList<Conduit> = read_success_json(response, "conduit create").await?;
        list.data
            .into_iter()
            .next()
            .context("Conduit create response contained no conduit")
    }

    async fn set_shard_count(&self, conduit_id: &str, shard_count: u32) -> Result<Conduit> {
        let response = self
            .authorized(self.client.patch(self.url("/eventsub/conduits")))
            .json(&serde_json::json!({ "id": conduit_id, "shard_count": shard_count }))
            .send()
            .await
            .context("Failed to send conduit update request")?;
        let list: HelixList<Conduit> = read_success_json(response, "conduit update").await?;
        tracing::debug!(conduits = ?list.data, "Conduit update response");
        list.data
            .into_iter()
            .next()
            .context("Conduit update response contained no conduit")
    }

    async fn set_shard_transport(
        &self,
        conduit_id: &str,
        shard_id: u32,
        transport: &WebhookTransport,
    ) -> Result<()> {
        let body = serde_json::json!({
            "conduit_id": conduit_id,
            "shards": [{ "id": shard_id.to_string(), "transport": transport }],
        });
        let response = self
            .authorized(self.client.patch(self.url("/eventsub/conduits/shards")))
            .json(&body)
            .send()
            .await
            .context("Failed to send shard update request")?;
        let update: ShardUpdateResponse = read_success_json(response, "shard update").await?;

        if let Some(err) = update.errors.iter().find(|e| e.id == shard_id) {
            anyhow::bail!(
                "Twitch rejected transport for shard {}: {} ({})",
                err.id,
                err.message,
                err.code
            );
        }
        Ok(())
    }
}
