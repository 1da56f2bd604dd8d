//! EventSub webhook wire types: headers, message types and payloads.

pub mod router;
pub mod signature;

pub use router::{
    AuthorizationGrantHandler, ChatMessageHandler, FollowHandler, NotificationHandler,
    NotificationRouter,
};
pub use signature::{eventsub_signature, verify_eventsub_signature, SignatureError};

use serde::Deserialize;
use std::fmt;

// Header names are matched case-insensitively; kept lowercase so they are
// valid `HeaderName::from_static` input.
pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

pub const CHANNEL_FOLLOW: &str = "channel.follow";
pub const USER_AUTHORIZATION_GRANT: &str = "user.authorization.grant";
pub const CHANNEL_CHAT_MESSAGE: &str = "channel.chat.message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    WebhookCallbackVerification,
    Notification,
    Revocation,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "webhook_callback_verification" => Some(Self::WebhookCallbackVerification),
            "notification" => Some(Self::Notification),
            "revocation" => Some(Self::Revocation),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookCallbackVerification => "webhook_callback_verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct VerificationPayload {
    pub challenge: String,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationPayload {
    pub subscription: Subscription,
    #[serde(default)]
    pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct RevocationPayload {
    pub subscription: Subscription,
}

/// An authenticated notification handed from the gateway to the router.
#[derive(Debug, Clone)]
pub struct Notification {
    pub message_id: String,
    pub subscription: Subscription,
    pub event: serde_json::Value,
}

impl Notification {
    /// Deserialize the event body into the shape a handler expects.
    pub fn event_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.event)
    }
}

// ── Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FollowEvent {
    pub user_id: String,
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
    pub broadcaster_user_id: String,
    #[serde(default)]
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub broadcaster_user_name: String,
    #[serde(default)]
    pub followed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthorizationGrantEvent {
    pub client_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatMessageEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub broadcaster_user_name: String,
    pub chatter_user_id: String,
    pub chatter_user_login: String,
    #[serde(default)]
    pub chatter_user_name: String,
    pub message_id: String,
    pub message: ChatMessageBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatMessageBody {
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_parse_round_trips() {
        for ty in [
            MessageType::WebhookCallbackVerification,
            MessageType::Notification,
            MessageType::Revocation,
        ] {
            assert_eq!(MessageType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(MessageType::parse("keepalive"), None);
    }

    #[test]
    fn notification_payload_keeps_raw_event() {
        let payload: NotificationPayload = serde_json::from_str(
            r#"{
                "subscription": {"id": "sub-1", "type": "channel.follow", "version": "2", "status": "enabled"},
                "event": {"user_id": "1", "user_login": "viewer", "broadcaster_user_id": "2"}
            }"#,
        )
        .unwrap();
        assert_eq!(payload.subscription.kind, CHANNEL_FOLLOW);
        assert_eq!(payload.event["user_login"], "viewer");
    }

    #[test]
    fn chat_event_parses_from_notification() {
        let notification = Notification {
            message_id: "msg-1".into(),
            subscription: Subscription {
                id: "sub-1".into(),
                kind: CHANNEL_CHAT_MESSAGE.into(),
                version: "1".into(),
                status: "enabled".into(),
            },
            event: serde_json::json!({
                "broadcaster_user_id": "100",
                "broadcaster_user_login": "streamer",
                "broadcaster_user_name": "Streamer",
                "chatter_user_id": "200",
                "chatter_user_login": "viewer",
                "chatter_user_name": "Viewer",
                "message_id": "chat-1",
                "message": {"text": "!checkhand verbose", "fragments": []},
                "color": "#FF0000"
            }),
        };
        let event: ChatMessageEvent = notification.event_as().unwrap();
        assert_eq!(event.message.text, "!checkhand verbose");
        assert_eq!(event.chatter_user_name, "Viewer");
    }

    #[test]
    fn verification_payload_requires_challenge() {
        assert!(serde_json::from_str::<VerificationPayload>(r#"{"subscription":null}"#).is_err());
        let ok: VerificationPayload = serde_json::from_str(r#"{"challenge":"abc123"}"#).unwrap();
        assert_eq!(ok.challenge, "abc123");
    }
}
