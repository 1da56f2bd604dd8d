pub mod schema;
pub mod store;

pub use schema::{
    resolve_config_dir, CommandsConfig, Config, EventSubConfig, GatewayConfig, LoggingConfig,
    TwitchConfig, UnsignedRequestPolicy, CONFIG_DIR_ENV, LOG_FILE_PREFIX,
};
pub use store::ConfigStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(config.twitch.client_id.is_empty());
        assert_eq!(config.gateway.unsigned_requests, UnsignedRequestPolicy::Ignore);
        assert_eq!(config.commands.prefix, "!");
    }

    #[test]
    fn reexported_section_configs_are_constructible() {
        let eventsub = EventSubConfig {
            secret: "0123456789".into(),
            host: "bot.example.com".into(),
            conduit_id: "conduit".into(),
        };
        let commands = CommandsConfig {
            prefix: "?".into(),
        };

        assert_eq!(eventsub.callback_url(), "https://bot.example.com/twitch/callback");
        assert_eq!(commands.prefix, "?");
        assert_eq!(GatewayConfig::default().dedup_ttl_secs, 600);
        assert!(TwitchConfig::default().bot_user_id.is_none());
    }
}
