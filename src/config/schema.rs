use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Environment variable that relocates the config directory.
pub const CONFIG_DIR_ENV: &str = "NEPBOT_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Nepbot configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` / `NEPBOT_CONFIG_DIR` env → `~/.nepbot/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Twitch application credentials and EventSub settings (`[twitch]`).
    #[serde(default)]
    pub twitch: TwitchConfig,

    /// Webhook listener settings (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Chat command parsing (`[commands]`).
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Log file settings (`[logging]`).
    #[serde(default)]
    pub logging: LoggingConfig,

    /// File values of fields replaced by env overrides - restored on save
    #[serde(skip)]
    env_shadowed: EnvShadowed,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            twitch: TwitchConfig::default(),
            gateway: GatewayConfig::default(),
            commands: CommandsConfig::default(),
            logging: LoggingConfig::default(),
            env_shadowed: EnvShadowed::default(),
        }
    }
}

/// A config value as read from the file and the env value that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Shadowed<T> {
    file: T,
    env: T,
}

impl<T: Clone + PartialEq> Shadowed<T> {
    fn replace(slot: &mut T, env: T) -> Self {
        let file = std::mem::replace(slot, env.clone());
        Self { file, env }
    }

    /// Put the file value back unless the field changed at runtime.
    fn restore(shadow: Option<&Self>, slot: &mut T) {
        if let Some(shadow) = shadow {
            if *slot == shadow.env {
                slot.clone_from(&shadow.file);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EnvShadowed {
    client_id: Option<Shadowed<String>>,
    client_secret: Option<Shadowed<String>>,
    eventsub_secret: Option<Shadowed<String>>,
    eventsub_host: Option<Shadowed<String>>,
    conduit_id: Option<Shadowed<String>>,
    gateway_port: Option<Shadowed<u16>>,
}

// ── Twitch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwitchConfig {
    /// Application client id. Overridden by `NEPBOT_CLIENT_ID`.
    #[serde(default)]
    pub client_id: String,
    /// Application client secret. Overridden by `NEPBOT_CLIENT_SECRET`.
    #[serde(default)]
    pub client_secret: String,
    /// Last app access token known to be valid (managed automatically).
    #[serde(default)]
    pub last_token: String,
    /// Identity service base URL (validate + token endpoints).
    #[serde(default = "default_id_base_url")]
    pub id_base_url: String,
    /// Helix API base URL.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Timeout for every upstream request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How often the running bot re-validates its token (0 disables).
    #[serde(default = "default_token_validate_interval_secs")]
    pub token_validate_interval_secs: u64,
    /// User id of the bot account. When set, command replies are posted to chat.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    /// Conduit and webhook transport settings (`[twitch.eventsub]`).
    #[serde(default)]
    pub eventsub: EventSubConfig,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            last_token: String::new(),
            id_base_url: default_id_base_url(),
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            token_validate_interval_secs: default_token_validate_interval_secs(),
            bot_user_id: None,
            eventsub: EventSubConfig::default(),
        }
    }
}

fn default_id_base_url() -> String {
    "https://id.twitch.tv".into()
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_token_validate_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubConfig {
    /// Webhook signing secret shared with Twitch (10-100 ASCII chars).
    #[serde(default)]
    pub secret: String,
    /// Public host name the callback URL is built from (no scheme).
    #[serde(default)]
    pub host: String,
    /// Conduit this bot registers its shard in. Filled in on bootstrap when empty.
    #[serde(default)]
    pub conduit_id: String,
}

impl EventSubConfig {
    /// Path Twitch delivers webhook messages to.
    pub const CALLBACK_PATH: &'static str = "/twitch/callback";

    /// `https://<host>`, the prefix that identifies our shard's callback.
    pub fn callback_prefix(&self) -> String {
        format!("https://{}", self.host)
    }

    /// Full callback URL registered on our shard.
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.callback_prefix(), Self::CALLBACK_PATH)
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// What the gateway does with a POST that carries no signature header.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnsignedRequestPolicy {
    /// Answer with an empty 204 and do nothing else.
    ///
    /// The request still gets a response rather than a dropped connection;
    /// nothing is parsed, recorded or dispatched.
    #[default]
    Ignore,
    /// Answer with 401 like a bad signature.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port (default: 8080). Overridden by `NEPBOT_GATEWAY_PORT`.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default)]
    pub unsigned_requests: UnsignedRequestPolicy,
    /// Reject messages whose timestamp is older than this many seconds (0 = off).
    #[serde(default)]
    pub max_message_age_secs: u64,
    /// How long notification message ids are remembered for redelivery dedup.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Maximum distinct message ids retained in memory.
    #[serde(default = "default_dedup_max_keys")]
    pub dedup_max_keys: usize,
    /// Notifications buffered between the gateway and the dispatcher.
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            unsigned_requests: UnsignedRequestPolicy::default(),
            max_message_age_secs: 0,
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_max_keys: default_dedup_max_keys(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
        }
    }
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

fn default_dedup_max_keys() -> usize {
    10_000
}

fn default_dispatch_queue_capacity() -> usize {
    256
}

// ── Commands ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    /// Prefix that marks a chat message as a command.
    #[serde(default = "default_command_prefix")]
    pub prefix: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefix: default_command_prefix(),
        }
    }
}

fn default_command_prefix() -> String {
    "!".into()
}

// ── Logging ───────────────────────────────────────────────────────

/// File prefix of the daily-rotated debug log (`debug.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "debug.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Write a debug-level, daily-rotated log file next to the console output.
    #[serde(default = "default_true")]
    pub file_enabled: bool,
    /// Log directory. Relative paths resolve against the config directory.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: true,
            dir: default_log_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

// ── Loading / saving ──────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".nepbot"))
}

/// Resolve the config directory: explicit argument, then env, then `~/.nepbot`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    default_config_dir()
}

impl Config {
    /// Load `config.toml` from `config_dir`, writing a default file if none exists.
    ///
    /// Env overrides are applied but validation is left to the caller, so a
    /// freshly initialized file can be reported with a helpful message.
    pub async fn load_or_init(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        if config_path.exists() {
            // Warn if config file is world-readable (holds client secret and token)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.apply_env_overrides();
            tracing::info!(
                path = %config.config_path.display(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config {
                config_path,
                ..Config::default()
            };
            config.save().await?;
            config.apply_env_overrides();
            tracing::info!(
                path = %config.config_path.display(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.twitch.client_id.trim().is_empty() {
            anyhow::bail!("twitch.client_id must not be empty");
        }
        if self.twitch.client_secret.trim().is_empty() {
            anyhow::bail!("twitch.client_secret must not be empty");
        }
        let secret_len = self.twitch.eventsub.secret.len();
        if !(10..=100).contains(&secret_len) {
            anyhow::bail!(
                "twitch.eventsub.secret must be 10-100 characters (got {secret_len})"
            );
        }
        let host = self.twitch.eventsub.host.trim();
        if host.is_empty() {
            anyhow::bail!("twitch.eventsub.host must not be empty");
        }
        if host.contains("://") || host.contains('/') {
            anyhow::bail!("twitch.eventsub.host must be a bare host name, got {host:?}");
        }
        if self.twitch.request_timeout_secs == 0 {
            anyhow::bail!("twitch.request_timeout_secs must be greater than 0");
        }
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.dispatch_queue_capacity == 0 {
            anyhow::bail!("gateway.dispatch_queue_capacity must be greater than 0");
        }
        if self.commands.prefix.is_empty() {
            anyhow::bail!("commands.prefix must not be empty");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`, remembering the file values they replace
    /// so [`Config::save`] never writes env-sourced secrets to disk.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let shadowed = &mut self.env_shadowed;

        if let Some(id) = non_empty("NEPBOT_CLIENT_ID") {
            shadowed.client_id = Some(Shadowed::replace(&mut self.twitch.client_id, id));
        }
        if let Some(secret) = non_empty("NEPBOT_CLIENT_SECRET") {
            shadowed.client_secret =
                Some(Shadowed::replace(&mut self.twitch.client_secret, secret));
        }
        if let Some(secret) = non_empty("NEPBOT_EVENTSUB_SECRET") {
            shadowed.eventsub_secret =
                Some(Shadowed::replace(&mut self.twitch.eventsub.secret, secret));
        }
        if let Some(host) = non_empty("NEPBOT_EVENTSUB_HOST") {
            shadowed.eventsub_host =
                Some(Shadowed::replace(&mut self.twitch.eventsub.host, host));
        }
        if let Some(conduit_id) = non_empty("NEPBOT_CONDUIT_ID") {
            shadowed.conduit_id =
                Some(Shadowed::replace(&mut self.twitch.eventsub.conduit_id, conduit_id));
        }
        if let Some(port) = non_empty("NEPBOT_GATEWAY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    shadowed.gateway_port = Some(Shadowed::replace(&mut self.gateway.port, port));
                }
                Err(_) => tracing::warn!("Ignoring invalid NEPBOT_GATEWAY_PORT: {port}"),
            }
        }
    }

    /// Copy of this config as it should appear on disk: overridden fields
    /// that were not changed at runtime carry their file values.
    fn to_file_values(&self) -> Config {
        let mut on_disk = self.clone();
        let shadowed = &self.env_shadowed;
        Shadowed::restore(shadowed.client_id.as_ref(), &mut on_disk.twitch.client_id);
        Shadowed::restore(
            shadowed.client_secret.as_ref(),
            &mut on_disk.twitch.client_secret,
        );
        Shadowed::restore(
            shadowed.eventsub_secret.as_ref(),
            &mut on_disk.twitch.eventsub.secret,
        );
        Shadowed::restore(
            shadowed.eventsub_host.as_ref(),
            &mut on_disk.twitch.eventsub.host,
        );
        Shadowed::restore(
            shadowed.conduit_id.as_ref(),
            &mut on_disk.twitch.eventsub.conduit_id,
        );
        Shadowed::restore(shadowed.gateway_port.as_ref(), &mut on_disk.gateway.port);
        on_disk
    }

    /// Directory for the rotating log file, or `None` when file logging is off.
    pub fn log_dir(&self) -> Option<PathBuf> {
        if !self.logging.file_enabled {
            return None;
        }
        let base = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Some(base.join(&self.logging.dir))
    }

    /// Atomically write the config back to `config_path`.
    pub async fn save(&self) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(&self.to_file_values()).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut options = OpenOptions::new();
        options.create_new(true).write(true);
        // Holds the client secret and token; the rename carries this mode over.
        #[cfg(unix)]
        options.mode(0o600);
        let mut temp_file = options
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
