//! Notification dispatch by subscription type.
//!
//! The gateway acknowledges a notification before it reaches this module;
//! nothing here can change the HTTP response.

use super::{
    AuthorizationGrantEvent, ChatMessageEvent, FollowEvent, Notification, CHANNEL_CHAT_MESSAGE,
    CHANNEL_FOLLOW, USER_AUTHORIZATION_GRANT,
};
use crate::commands::CommandProcessor;
use crate::reply::ReplySender;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// Notifications handled concurrently by [`NotificationRouter::run`].
pub const MAX_IN_FLIGHT_NOTIFICATIONS: usize = 8;

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Subscription type this handler is registered under.
    fn subscription_type(&self) -> &'static str;

    async fn handle(&self, notification: &Notification) -> Result<()>;
}

pub struct FollowHandler;

#[async_trait]
impl NotificationHandler for FollowHandler {
    fn subscription_type(&self) -> &'static str {
        CHANNEL_FOLLOW
    }

    async fn handle(&self, notification: &Notification) -> Result<()> {
        let event: FollowEvent = notification.event_as()?;
        tracing::debug!(
            "{} has followed {}!",
            event.user_name,
            event.broadcaster_user_name
        );
        Ok(())
    }
}

pub struct AuthorizationGrantHandler;

#[async_trait]
impl NotificationHandler for AuthorizationGrantHandler {
    fn subscription_type(&self) -> &'static str {
        USER_AUTHORIZATION_GRANT
    }

    async fn handle(&self, notification: &Notification) -> Result<()> {
        let event: AuthorizationGrantEvent = notification.event_as()?;
        tracing::info!("{} authorized {}", event.user_name, event.client_id);
        Ok(())
    }
}

/// Feeds chat messages to the command processor and sends back any reply.
pub struct ChatMessageHandler {
    processor: Arc<dyn CommandProcessor>,
    replies: Arc<dyn ReplySender>,
}

impl ChatMessageHandler {
    pub fn new(processor: Arc<dyn CommandProcessor>, replies: Arc<dyn ReplySender>) -> Self {
        Self { processor, replies }
    }
}

#[async_trait]
impl NotificationHandler for ChatMessageHandler {
    fn subscription_type(&self) -> &'static str {
        CHANNEL_CHAT_MESSAGE
    }

    async fn handle(&self, notification: &Notification) -> Result<()> {
        let event: ChatMessageEvent = notification.event_as()?;
        if let Some(reply) = self.processor.process(&event).await {
            if let Err(e) = self.replies.send(&event, &reply).await {
                tracing::error!(
                    broadcaster_id = %event.broadcaster_user_id,
                    "Failed to send reply: {e:#}"
                );
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NotificationRouter {
    handlers: HashMap<&'static str, Arc<dyn NotificationHandler>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the follow, grant and chat handlers installed.
    pub fn with_default_handlers(
        processor: Arc<dyn CommandProcessor>,
        replies: Arc<dyn ReplySender>,
    ) -> Self {
        let mut router = Self::new();
        router.register(Arc::new(FollowHandler));
        router.register(Arc::new(AuthorizationGrantHandler));
        router.register(Arc::new(ChatMessageHandler::new(processor, replies)));
        router
    }

    pub fn register(&mut self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.insert(handler.subscription_type(), handler);
    }

    /// Route one notification. Returns `false` when no handler knows its type.
    pub async fn dispatch(&self, notification: &Notification) -> bool {
        let kind = notification.subscription.kind.as_str();
        let Some(handler) = self.handlers.get(kind) else {
            tracing::warn!("Got unknown notification type {kind}");
            return false;
        };

        if let Err(e) = handler.handle(notification).await {
            tracing::error!(
                subscription_type = kind,
                message_id = %notification.message_id,
                "Notification handler failed: {e:#}"
            );
        }
        true
    }

    /// Drain `rx` until every sender is dropped, handling up to
    /// [`MAX_IN_FLIGHT_NOTIFICATIONS`] notifications at once.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Notification>) {
        let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT_NOTIFICATIONS));
        let mut workers = JoinSet::new();

        while let Some(notification) = rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let router = Arc::clone(&self);
            workers.spawn(async move {
                let _permit = permit;
                router.dispatch(&notification).await;
            });

            while let Some(result) = workers.try_join_next() {
                log_worker_join_result(result);
            }
        }

        while let Some(result) = workers.join_next().await {
            log_worker_join_result(result);
        }
        tracing::debug!("Notification dispatcher stopped");
    }
}

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Notification worker panicked: {e}");
    }
}
