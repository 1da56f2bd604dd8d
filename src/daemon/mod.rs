//! Startup orchestration: token, listener, reconciliation, then serve.

use crate::auth::TokenManager;
use crate::commands::{Command, CommandRegistry};
use crate::conduit::{ReconcileOutcome, ShardReconciler};
use crate::config::{Config, ConfigStore};
use crate::error::FatalError;
use crate::eventsub::NotificationRouter;
use crate::gateway::{self, AppState};
use crate::helix::{self, ConduitApi, HelixClient};
use crate::reply::{HelixChatSender, LogReplySender, ReplySender};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

fn build_notification_router(
    store: &Arc<ConfigStore>,
    helix: &Arc<HelixClient>,
    commands: Vec<Arc<dyn Command>>,
) -> NotificationRouter {
    let mut registry = CommandRegistry::new(store.subscribe());
    for command in commands {
        registry.register(command);
    }
    tracing::info!(commands = registry.len(), "Command processor ready");

    let bot_user_id = store
        .current()
        .twitch
        .bot_user_id
        .clone()
        .filter(|id| !id.trim().is_empty());
    let replies: Arc<dyn ReplySender> = match bot_user_id {
        Some(id) => Arc::new(HelixChatSender::new(Arc::clone(helix), id)),
        None => {
            tracing::info!("No bot_user_id configured; replies are only logged");
            Arc::new(LogReplySender)
        }
    };

    NotificationRouter::with_default_handlers(Arc::new(registry), replies)
}

fn log_outcome(outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::AlreadyEnabled { shard_id } => {
            tracing::info!(shard_id, "Shard already enabled");
        }
        ReconcileOutcome::Repaired { shard_id } => {
            tracing::info!(shard_id, "Shard transport re-issued");
        }
        ReconcileOutcome::Claimed {
            shard_id,
            shard_count,
        } => {
            tracing::info!(shard_id, shard_count, "Shard claimed");
        }
        ReconcileOutcome::Aborted { reason } => {
            tracing::error!("Shard reconciliation aborted, events may not arrive: {reason}");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Run the bot until Ctrl-C.
///
/// Ordering matters: the listener is bound before the reconciler runs,
/// because setting a shard's transport makes Twitch send a verification
/// request to the callback immediately.
pub async fn run(config: Config, commands: Vec<Arc<dyn Command>>) -> Result<(), FatalError> {
    let store = Arc::new(ConfigStore::new(config));
    let client = helix::build_http_client(store.current().twitch.request_timeout_secs)?;

    tracing::info!("Initializing...");
    let tokens = Arc::new(TokenManager::new(Arc::clone(&store), client.clone()));
    tokens.ensure_valid_token().await?;

    let helix = Arc::new(HelixClient::new(Arc::clone(&store), client));
    let router = Arc::new(build_notification_router(&store, &helix, commands));
    let (tx, rx) = mpsc::channel(store.current().gateway.dispatch_queue_capacity);
    let dispatcher = tokio::spawn(router.run(rx));

    tracing::info!("Starting EventSub listener...");
    let listener = gateway::bind(&store.current().gateway).await?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let state = AppState::new(Arc::clone(&store), tx);
    let mut server = tokio::spawn(gateway::serve(listener, state, async {
        let _ = stop_rx.await;
    }));

    let api: Arc<dyn ConduitApi> = helix;
    let reconciler = ShardReconciler::new(api, Arc::clone(&store));
    let outcome = match reconciler.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = stop_tx.send(());
            let _ = server.await;
            dispatcher.abort();
            return Err(e);
        }
    };
    log_outcome(&outcome);
    tracing::info!("Initialization complete, we should now be listening to events!");

    let interval_secs = store.current().twitch.token_validate_interval_secs;
    let revalidation: Option<JoinHandle<()>> = (interval_secs > 0)
        .then(|| Arc::clone(&tokens).spawn_revalidation(Duration::from_secs(interval_secs)));

    let early_exit = tokio::select! {
        result = &mut server => Some(result),
        () = shutdown_signal() => None,
    };

    if let Some(handle) = &revalidation {
        handle.abort();
    }

    let served = match early_exit {
        Some(result) => result,
        None => {
            let _ = stop_tx.send(());
            server.await
        }
    };
    // The server owned the last queue sender; the dispatcher drains and stops.
    if let Err(e) = dispatcher.await {
        tracing::error!("Notification dispatcher failed: {e}");
    }

    match served {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FatalError::Startup(e)),
        Err(e) => Err(FatalError::Startup(anyhow!("gateway task failed: {e}"))),
    }
}

/// Print the conduit's shards without changing anything remotely.
pub async fn show_shards(config: Config) -> Result<(), FatalError> {
    let store = Arc::new(ConfigStore::new(config));
    let client = helix::build_http_client(store.current().twitch.request_timeout_secs)?;
    TokenManager::new(Arc::clone(&store), client.clone())
        .ensure_valid_token()
        .await?;

    let api: Arc<dyn ConduitApi> = Arc::new(HelixClient::new(Arc::clone(&store), client));
    let reconciler = ShardReconciler::new(api, Arc::clone(&store));
    let conduit_id = store.current().twitch.eventsub.conduit_id.clone();

    let Some(conduit) = reconciler.fetch_conduit().await? else {
        println!("Conduit {conduit_id:?} not found for this client id.");
        return Ok(());
    };
    let shards = reconciler.fetch_shards(&conduit.id).await?;
    let prefix = store.current().twitch.eventsub.callback_prefix();

    println!("Conduit {} (shard_count {})", conduit.id, conduit.shard_count);
    println!("{:>5}  {:<40}  {:<10}  target", "id", "status", "method");
    for shard in &shards {
        let target = shard
            .transport
            .callback
            .as_deref()
            .or(shard.transport.session_id.as_deref())
            .unwrap_or("-");
        let marker = if shard.is_owned_by(&prefix) { "  (this bot)" } else { "" };
        println!(
            "{:>5}  {:<40}  {:<10}  {target}{marker}",
            shard.id,
            shard.status.as_str(),
            shard.transport.method
        );
    }
    if shards.is_empty() {
        println!("(no shards)");
    }
    Ok(())
}
