#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nepbot::config::{resolve_config_dir, Config, LOG_FILE_PREFIX};
use nepbot::{daemon, FatalError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Set to `true` to log at debug level when `RUST_LOG` is unset.
const DEBUG_ENV: &str = "NEPBOT_DEBUG";

/// The log file always records our own debug output, independent of `RUST_LOG`.
const FILE_LOG_FILTER: &str = "info,nepbot=debug";

#[derive(Parser, Debug)]
#[command(name = "nepbot")]
#[command(version)]
#[command(about = "Twitch chat bot backend: EventSub webhook listener and conduit shard manager.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: $NEPBOT_CONFIG_DIR, then ~/.nepbot)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Start the bot (default)
    #[command(long_about = "\
Start the bot.

Validates (or mints) the app access token, starts the webhook listener, \
makes sure this instance owns an enabled shard in the configured conduit \
and then serves EventSub deliveries until Ctrl-C.")]
    Serve,

    /// Print the conduit's shards without changing them
    Shards,
}

fn default_log_level(debug_flag: Option<&str>) -> &'static str {
    if debug_flag.is_some_and(|v| v.trim() == "true") {
        "debug"
    } else {
        "info"
    }
}

fn console_filter() -> EnvFilter {
    let debug_flag = std::env::var(DEBUG_ENV).ok();
    let default_level = default_log_level(debug_flag.as_deref());

    // RUST_LOG wins over NEPBOT_DEBUG
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Console-only subscriber used while the config (and with it the log
/// directory) is still being loaded.
fn startup_subscriber() -> impl tracing::Subscriber + Send + Sync {
    fmt::Subscriber::builder()
        .with_env_filter(console_filter())
        .finish()
}

fn build_file_appender(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir)
        .with_context(|| format!("Failed to open log directory {}", dir.display()))
}

/// Install the console layer plus, when configured, the rotating debug log.
///
/// The returned guard flushes the file writer on drop and must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_writer, guard) = match log_dir.map(build_file_appender) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("Warning: file logging disabled: {e:#}");
            (None, None)
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(EnvFilter::new(FILE_LOG_FILTER))
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter()))
        .with(file_layer)
        .try_init()
    {
        eprintln!("Warning: failed to install log subscriber: {e}");
    }
    guard
}

async fn load_config(config_dir: Option<&Path>) -> Result<Config> {
    let dir = resolve_config_dir(config_dir)?;
    let config = Config::load_or_init(&dir).await?;
    config.validate().with_context(|| {
        format!(
            "Invalid configuration in {} (fill in [twitch] and [twitch.eventsub])",
            config.config_path.display()
        )
    })?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = {
        let _startup_logs = tracing::subscriber::set_default(startup_subscriber());
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "nepbot starting");
        load_config(cli.config_dir.as_deref()).await
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            let err = FatalError::Startup(e);
            let _startup_logs = tracing::subscriber::set_default(startup_subscriber());
            tracing::error!("{err}");
            return ExitCode::from(err.exit_code());
        }
    };
    let log_dir = config.log_dir();
    let _log_guard = init_tracing(log_dir.as_deref());
    if let Some(dir) = &log_dir {
        tracing::debug!(dir = %dir.display(), "Writing debug log file");
    }

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => daemon::run(config, Vec::new()).await,
        Commands::Shards => daemon::show_shards(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["nepbot"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.command.unwrap_or(Commands::Serve), Commands::Serve);
    }

    #[test]
    fn config_dir_is_global() {
        let cli = Cli::try_parse_from(["nepbot", "shards", "--config-dir", "/tmp/nepbot"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Shards));
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/nepbot")));
    }

    #[test]
    fn file_appender_creates_log_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");

        let appender = build_file_appender(&dir);

        assert!(appender.is_ok());
        assert!(dir.is_dir());
    }

    #[test]
    fn debug_flag_selects_debug_level() {
        assert_eq!(default_log_level(Some("true")), "debug");
        assert_eq!(default_log_level(Some("false")), "info");
        assert_eq!(default_log_level(None), "info");
    }
}
