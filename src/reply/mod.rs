//! Where command replies go.

use crate::eventsub::ChatMessageEvent;
use crate::helix::HelixClient;
use crate::util::truncate_with_ellipsis;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Twitch rejects chat messages longer than this.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 500;

#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Reply to `incoming` with `reply`.
    async fn send(&self, incoming: &ChatMessageEvent, reply: &str) -> Result<()>;
}

/// Logs replies instead of posting them. Used when no bot account is configured.
#[derive(Debug, Default)]
pub struct LogReplySender;

#[async_trait]
impl ReplySender for LogReplySender {
    async fn send(&self, incoming: &ChatMessageEvent, reply: &str) -> Result<()> {
        tracing::info!(
            broadcaster_id = %incoming.broadcaster_user_id,
            "Would reply in #{}: {reply}",
            incoming.broadcaster_user_login
        );
        Ok(())
    }
}

/// Posts replies to chat as the bot account, threaded under the message
/// that triggered them.
pub struct HelixChatSender {
    helix: Arc<HelixClient>,
    bot_user_id: String,
}

impl HelixChatSender {
    pub fn new(helix: Arc<HelixClient>, bot_user_id: String) -> Self {
        Self { helix, bot_user_id }
    }
}

#[async_trait]
impl ReplySender for HelixChatSender {
    async fn send(&self, incoming: &ChatMessageEvent, reply: &str) -> Result<()> {
        let message = truncate_with_ellipsis(reply, MAX_CHAT_MESSAGE_CHARS - 3);
        let parent = Some(incoming.message_id.as_str()).filter(|id| !id.is_empty());
        self.helix
            .send_chat_message(
                &incoming.broadcaster_user_id,
                &self.bot_user_id,
                &message,
                parent,
            )
            .await?;
        tracing::debug!(
            broadcaster_id = %incoming.broadcaster_user_id,
            "Reply sent"
        );
        Ok(())
    }
}
