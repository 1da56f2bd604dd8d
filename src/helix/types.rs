use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Transport method Twitch uses for webhook shards.
pub const WEBHOOK_METHOD: &str = "webhook";

/// Standard Helix list envelope: `{ "data": [...], "pagination": { "cursor": ... } }`.
#[derive(Debug, Deserialize)]
pub struct HelixList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Conduit {
    pub id: String,
    pub shard_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Shard {
    #[serde(deserialize_with = "deserialize_shard_id")]
    pub id: u32,
    pub status: ShardStatus,
    pub transport: ShardTransport,
}

impl Shard {
    /// Whether this shard is a webhook shard whose callback lives under `callback_prefix`.
    pub fn is_owned_by(&self, callback_prefix: &str) -> bool {
        self.transport.method == WEBHOOK_METHOD
            && self
                .transport
                .callback
                .as_deref()
                .is_some_and(|cb| cb.starts_with(callback_prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShardTransport {
    pub method: String,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Transport written to a shard by the "set shard transport" primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookTransport {
    pub method: &'static str,
    pub callback: String,
    pub secret: String,
}

impl WebhookTransport {
    pub fn new(callback: String, secret: String) -> Self {
        Self {
            method: WEBHOOK_METHOD,
            callback,
            secret,
        }
    }
}

/// One page of `GET /eventsub/conduits/shards`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPage {
    pub shards: Vec<Shard>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ShardStatus {
    Enabled,
    WebhookCallbackVerificationPending,
    WebhookCallbackVerificationFailed,
    NotificationFailuresExceeded,
    /// Any websocket status or value this bot does not know how to handle.
    Other(String),
}

impl ShardStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Enabled => "enabled",
            Self::WebhookCallbackVerificationPending => "webhook_callback_verification_pending",
            Self::WebhookCallbackVerificationFailed => "webhook_callback_verification_failed",
            Self::NotificationFailuresExceeded => "notification_failures_exceeded",
            Self::Other(raw) => raw,
        }
    }

    /// Statuses that re-issuing the shard transport can fix.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            Self::WebhookCallbackVerificationPending
                | Self::WebhookCallbackVerificationFailed
                | Self::NotificationFailuresExceeded
        )
    }
}

impl From<String> for ShardStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "enabled" => Self::Enabled,
            "webhook_callback_verification_pending" => Self::WebhookCallbackVerificationPending,
            "webhook_callback_verification_failed" => Self::WebhookCallbackVerificationFailed,
            "notification_failures_exceeded" => Self::NotificationFailuresExceeded,
            _ => Self::Other(raw),
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-shard error entry in a `PATCH /eventsub/conduits/shards` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardUpdateError {
    #[serde(deserialize_with = "deserialize_shard_id")]
    pub id: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ShardUpdateResponse {
    #[serde(default)]
    pub errors: Vec<ShardUpdateError>,
}

/// Shard ids arrive as strings (`"0"`), older payloads used numbers.
fn deserialize_shard_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u32),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => Ok(n),
        RawId::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
