//! Shard reconciler: makes sure exactly one shard in our conduit delivers to
//! this instance's webhook.
//!
//! Runs once at startup, after the gateway is listening, because Twitch
//! verifies a shard's callback as soon as its transport is set.

use crate::config::ConfigStore;
use crate::error::FatalError;
use crate::helix::{Conduit, ConduitApi, Shard, ShardStatus, WebhookTransport};
use std::sync::Arc;

/// How many times a new slot is grown and claimed before giving up when
/// another actor keeps taking the slot first.
pub const MAX_CLAIM_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Our shard exists and is enabled; nothing was changed.
    AlreadyEnabled { shard_id: u32 },
    /// Our shard existed in a broken state and its transport was re-issued.
    Repaired { shard_id: u32 },
    /// No shard pointed at us; one was claimed.
    Claimed { shard_id: u32, shard_count: u32 },
    /// A mutating call failed; the bot keeps serving but may not receive events.
    Aborted { reason: String },
}

pub struct ShardReconciler {
    api: Arc<dyn ConduitApi>,
    config: Arc<ConfigStore>,
}

impl ShardReconciler {
    pub fn new(api: Arc<dyn ConduitApi>, config: Arc<ConfigStore>) -> Self {
        Self { api, config }
    }

    fn transport(&self) -> WebhookTransport {
        let config = self.config.current();
        WebhookTransport::new(
            config.twitch.eventsub.callback_url(),
            config.twitch.eventsub.secret.clone(),
        )
    }

    /// Fetch the configured conduit; `None` when it does not exist.
    pub async fn fetch_conduit(&self) -> Result<Option<Conduit>, FatalError> {
        let conduit_id = self.config.current().twitch.eventsub.conduit_id.clone();
        let conduits = self.api.list_conduits().await.map_err(|e| {
            tracing::error!("Error getting conduit details: {e:#}");
            FatalError::ConduitFetch(e)
        })?;
        Ok(conduits.into_iter().find(|c| c.id == conduit_id))
    }

    /// Fetch every shard of `conduit_id`, following the cursor page by page.
    pub async fn fetch_shards(&self, conduit_id: &str) -> Result<Vec<Shard>, FatalError> {
        let mut shards = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .api
                .list_shards(conduit_id, cursor.as_deref())
                .await
                .map_err(|e| {
                    tracing::error!("Error getting conduit shards: {e:#}");
                    FatalError::ShardFetch(e)
                })?;
            shards.extend(page.shards);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        tracing::debug!(count = shards.len(), "Fetched conduit shards");
        Ok(shards)
    }

    /// Full startup pass: fetch remote state, bootstrap a conduit if needed,
    /// then converge.
    pub async fn run(&self) -> Result<ReconcileOutcome, FatalError> {
        tracing::info!("Valid token gotten. Verifying conduit...");
        let Some(conduit) = self.fetch_conduit().await? else {
            return Ok(self.bootstrap_conduit().await);
        };
        let shards = self.fetch_shards(&conduit.id).await?;
        tracing::info!(
            conduit_id = %conduit.id,
            shard_count = conduit.shard_count,
            "Got shards for conduit, verifying my own status..."
        );
        self.reconcile(&conduit, &shards).await
    }

    /// Converge `conduit` so exactly one enabled shard points at this host.
    pub async fn reconcile(
        &self,
        conduit: &Conduit,
        shards: &[Shard],
    ) -> Result<ReconcileOutcome, FatalError> {
        let prefix = self.config.current().twitch.eventsub.callback_prefix();

        if let Some(ours) = shards.iter().find(|s| s.is_owned_by(&prefix)) {
            return match &ours.status {
                ShardStatus::Enabled => {
                    tracing::info!(
                        shard_id = ours.id,
                        "Shard active and enabled! No further action needed."
                    );
                    Ok(ReconcileOutcome::AlreadyEnabled { shard_id: ours.id })
                }
                status if status.is_repairable() => {
                    tracing::warn!(
                        shard_id = ours.id,
                        %status,
                        "Erroneous shard status, re-issuing transport"
                    );
                    Ok(match self.set_transport(&conduit.id, ours.id).await {
                        Ok(()) => ReconcileOutcome::Repaired { shard_id: ours.id },
                        Err(reason) => ReconcileOutcome::Aborted { reason },
                    })
                }
                status => {
                    tracing::error!(
                        shard_id = ours.id,
                        %status,
                        "Unknown own shard status. Aborting startup."
                    );
                    Err(FatalError::UnrecognizedShardStatus {
                        shard_id: ours.id,
                        status: status.to_string(),
                    })
                }
            };
        }

        tracing::warn!("Shard not found, adding shard...");
        // A brand-new conduit reports one empty slot; fill it instead of growing.
        let base_count = if conduit.shard_count == 1 && shards.is_empty() {
            0
        } else {
            conduit.shard_count
        };
        Ok(self.grow_and_claim(&conduit.id, base_count, &prefix).await)
    }

    /// Raise capacity to `base_count + 1` and claim the new top slot.
    ///
    /// Growing and claiming are two separate calls, so before claiming, the
    /// shard list is re-read; if another host already holds the slot the
    /// conduit is grown again, up to [`MAX_CLAIM_ATTEMPTS`] times.
    async fn grow_and_claim(
        &self,
        conduit_id: &str,
        mut base_count: u32,
        prefix: &str,
    ) -> ReconcileOutcome {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let requested = base_count + 1;
            let granted = match self.api.set_shard_count(conduit_id, requested).await {
                Ok(updated) => updated.shard_count,
                Err(e) => {
                    tracing::error!("Error updating conduit: {e:#}");
                    return ReconcileOutcome::Aborted {
                        reason: format!("conduit capacity update failed: {e:#}"),
                    };
                }
            };
            if granted != requested {
                tracing::warn!(
                    requested,
                    granted,
                    "Conduit capacity differs from the requested value"
                );
            }

            let slot = requested - 1;
            if self.slot_taken_by_other(conduit_id, slot, prefix).await {
                tracing::warn!(slot, attempt, "New shard slot was claimed concurrently, growing again");
                base_count = granted.max(requested);
                continue;
            }

            return match self.set_transport(conduit_id, slot).await {
                Ok(()) => {
                    tracing::info!(shard_id = slot, shard_count = requested, "Claimed shard");
                    ReconcileOutcome::Claimed {
                        shard_id: slot,
                        shard_count: requested,
                    }
                }
                Err(reason) => ReconcileOutcome::Aborted { reason },
            };
        }

        ReconcileOutcome::Aborted {
            reason: format!("gave up claiming a shard after {MAX_CLAIM_ATTEMPTS} attempts"),
        }
    }

    async fn slot_taken_by_other(&self, conduit_id: &str, slot: u32, prefix: &str) -> bool {
        match self.fetch_shards(conduit_id).await {
            Ok(shards) => shards.iter().any(|s| {
                s.id == slot
                    && !s.is_owned_by(prefix)
                    && (s.transport.callback.as_deref().is_some_and(|c| !c.is_empty())
                        || s.transport.session_id.as_deref().is_some_and(|c| !c.is_empty()))
            }),
            Err(e) => {
                tracing::warn!("Could not re-check shard slot {slot}, claiming anyway: {e}");
                false
            }
        }
    }

    /// No usable conduit: create one with a single slot, remember its id and
    /// claim slot 0.
    async fn bootstrap_conduit(&self) -> ReconcileOutcome {
        let configured = self.config.current().twitch.eventsub.conduit_id.clone();
        if configured.is_empty() {
            tracing::info!("No conduit configured, creating one");
        } else {
            tracing::warn!(conduit_id = %configured, "Configured conduit not found, creating a new one");
        }

        let conduit = match self.api.create_conduit(1).await {
            Ok(conduit) => conduit,
            Err(e) => {
                tracing::error!("Error creating conduit: {e:#}");
                return ReconcileOutcome::Aborted {
                    reason: format!("conduit creation failed: {e:#}"),
                };
            }
        };

        self.config
            .update(|cfg| cfg.twitch.eventsub.conduit_id = conduit.id.clone());
        if let Err(e) = self.config.persist().await {
            tracing::error!(conduit_id = %conduit.id, "Failed to persist new conduit id: {e:#}");
        }

        match self.set_transport(&conduit.id, 0).await {
            Ok(()) => ReconcileOutcome::Claimed {
                shard_id: 0,
                shard_count: conduit.shard_count,
            },
            Err(reason) => ReconcileOutcome::Aborted { reason },
        }
    }

    async fn set_transport(&self, conduit_id: &str, shard_id: u32) -> Result<(), String> {
        self.api
            .set_shard_transport(conduit_id, shard_id, &self.transport())
            .await
            .map_err(|e| {
                tracing::error!(shard_id, "Error updating own shard: {e:#}");
                format!("shard {shard_id} transport update failed: {e:#}")
            })
    }
}
