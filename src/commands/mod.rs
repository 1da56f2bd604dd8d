//! Chat command parsing and dispatch.
//!
//! The bot ships with an empty registry; concrete commands implement
//! [`Command`] and are registered at startup.

use crate::config::Config;
use crate::eventsub::ChatMessageEvent;
use crate::util::truncate_with_ellipsis;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Longest chat text echoed into a log line.
const LOG_TEXT_MAX_CHARS: usize = 200;

/// Turns a chat message into an optional reply.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    async fn process(&self, event: &ChatMessageEvent) -> Option<String>;
}

/// Who sent a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: String,
    pub login: String,
    pub display: String,
}

/// Everything a command sees about one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    /// Login of the channel the message was sent in.
    pub channel: String,
    pub broadcaster_id: String,
    pub sender: Sender,
    /// Command name without prefix, lowercased.
    pub name: String,
    pub args: Vec<String>,
    pub message_id: String,
}

#[async_trait]
pub trait Command: Send + Sync {
    /// Name the command is invoked by, without prefix.
    fn name(&self) -> &str;

    /// Run the command; `Ok(None)` means "no reply".
    async fn handle(&self, ctx: &CommandContext) -> Result<Option<String>>;
}

/// Split `text` into `(name, args)` when it starts with `prefix`.
pub fn parse_command(prefix: &str, text: &str) -> Option<(String, Vec<String>)> {
    let rest = text.strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?;
    // "! foo" is not a command
    if rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((
        name.to_lowercase(),
        parts.map(str::to_owned).collect(),
    ))
}

pub struct CommandRegistry {
    config: watch::Receiver<Arc<Config>>,
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    /// The command prefix is read from `config` on every message, so a
    /// config update takes effect immediately.
    pub fn new(config: watch::Receiver<Arc<Config>>) -> Self {
        Self {
            config,
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: Arc<dyn Command>) {
        let name = command.name().to_lowercase();
        if self.commands.insert(name.clone(), command).is_some() {
            tracing::warn!(command = %name, "Command registered twice, keeping the latest");
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn prefix(&self) -> String {
        self.config.borrow().commands.prefix.clone()
    }
}

#[async_trait]
impl CommandProcessor for CommandRegistry {
    async fn process(&self, event: &ChatMessageEvent) -> Option<String> {
        let channel = &event.broadcaster_user_login;
        let text = &event.message.text;
        tracing::info!(
            "[CHAT][#{channel}] {}: {}",
            event.chatter_user_login,
            truncate_with_ellipsis(text, LOG_TEXT_MAX_CHARS)
        );

        let Some((name, args)) = parse_command(&self.prefix(), text) else {
            tracing::debug!("No command, aborting early.");
            return None;
        };
        tracing::info!("[COMMAND][#{channel}] {}: {name}", event.chatter_user_login);

        let Some(command) = self.commands.get(&name) else {
            tracing::debug!(command = %name, "[COMMAND] Unknown command.");
            return None;
        };

        let ctx = CommandContext {
            channel: channel.clone(),
            broadcaster_id: event.broadcaster_user_id.clone(),
            sender: Sender {
                id: event.chatter_user_id.clone(),
                login: event.chatter_user_login.clone(),
                display: event.chatter_user_name.clone(),
            },
            name,
            args,
            message_id: event.message_id.clone(),
        };

        match command.handle(&ctx).await {
            Ok(reply) => reply.filter(|r| !r.trim().is_empty()),
            Err(e) => {
                tracing::error!(command = %ctx.name, "Command failed: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::eventsub::ChatMessageBody;

    struct Echo;

    #[async_trait]
    impl Command for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(&self, ctx: &CommandContext) -> Result<Option<String>> {
            Ok(Some(format!("{}: {}", ctx.sender.display, ctx.args.join(" "))))
        }
    }

    struct Silent;

    #[async_trait]
    impl Command for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn handle(&self, _ctx: &CommandContext) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct Broken;

    #[async_trait]
    impl Command for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn handle(&self, _ctx: &CommandContext) -> Result<Option<String>> {
            anyhow::bail!("database unavailable")
        }
    }

    fn chat(text: &str) -> ChatMessageEvent {
        ChatMessageEvent {
            broadcaster_user_id: "100".into(),
            broadcaster_user_login: "streamer".into(),
            broadcaster_user_name: "Streamer".into(),
            chatter_user_id: "200".into(),
            chatter_user_login: "viewer".into(),
            chatter_user_name: "Viewer".into(),
            message_id: "chat-1".into(),
            message: ChatMessageBody { text: text.into() },
        }
    }

    fn registry(store: &ConfigStore) -> CommandRegistry {
        let mut registry = CommandRegistry::new(store.subscribe());
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Silent));
        registry.register(Arc::new(Broken));
        registry
    }

    #[test]
    fn parse_splits_name_and_args() {
        assert_eq!(
            parse_command("!", "!checkhand verbose  extra"),
            Some(("checkhand".into(), vec!["verbose".into(), "extra".into()]))
        );
        assert_eq!(parse_command("!", "!CheckHand"), Some(("checkhand".into(), vec![])));
    }

    #[test]
    fn parse_ignores_non_commands() {
        assert_eq!(parse_command("!", "hello chat"), None);
        assert_eq!(parse_command("!", "!"), None);
        assert_eq!(parse_command("!", "! spaced"), None);
        assert_eq!(parse_command("!", ""), None);
    }

    #[tokio::test]
    async fn registered_command_replies() {
        let store = ConfigStore::new(Config::default());
        let registry = registry(&store);
        assert_eq!(
            registry.process(&chat("!echo hi there")).await,
            Some("Viewer: hi there".into())
        );
    }

    #[tokio::test]
    async fn plain_text_and_unknown_commands_yield_nothing() {
        let store = ConfigStore::new(Config::default());
        let registry = registry(&store);
        assert_eq!(registry.process(&chat("just chatting")).await, None);
        assert_eq!(registry.process(&chat("!nope")).await, None);
        assert_eq!(registry.process(&chat("!silent")).await, None);
    }

    #[tokio::test]
    async fn failing_command_is_swallowed() {
        let store = ConfigStore::new(Config::default());
        let registry = registry(&store);
        assert_eq!(registry.process(&chat("!broken")).await, None);
    }

    #[tokio::test]
    async fn prefix_change_applies_without_rebuilding() {
        let store = ConfigStore::new(Config::default());
        let registry = registry(&store);
        store.update(|cfg| cfg.commands.prefix = "?".into());

        assert_eq!(registry.process(&chat("!echo a")).await, None);
        assert_eq!(registry.process(&chat("?echo a")).await, Some("Viewer: a".into()));
    }

    #[test]
    fn duplicate_registration_keeps_one_entry() {
        let store = ConfigStore::new(Config::default());
        let mut registry = CommandRegistry::new(store.subscribe());
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
