//! Foreground access to the running monitor
//!
//! The handle is cheap to clone and safe to use from any task. Reads go
//! through snapshot copies of the shared state; anything that mutates the
//! clone registry is shipped to the loop task as a command.

use super::{Command, SharedBatchSender};
use crate::error::{EngineError, EngineResult};
use crate::models::{CloneRecord, ScalingEvent, SnapshotBatch};
use crate::policy::{ClonePolicyConfig, CloneRegistry};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

/// Handle for consumers (UI, CLI, HTTP layer) of the monitor
#[derive(Clone)]
pub struct MonitorHandle {
    registry: Arc<CloneRegistry>,
    policy: Arc<RwLock<ClonePolicyConfig>>,
    policy_path: Option<PathBuf>,
    command_tx: mpsc::Sender<Command>,
    batch_tx: SharedBatchSender,
    shutdown_tx: broadcast::Sender<()>,
}

impl MonitorHandle {
    pub(crate) fn new(
        registry: Arc<CloneRegistry>,
        policy: Arc<RwLock<ClonePolicyConfig>>,
        command_tx: mpsc::Sender<Command>,
        batch_tx: SharedBatchSender,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            policy,
            policy_path: ClonePolicyConfig::default_path(),
            command_tx,
            batch_tx,
            shutdown_tx,
        }
    }

    /// Override where policy updates are persisted
    pub fn with_policy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    /// Subscribe to the stream of snapshot batches. Batches arrive in
    /// production order; a subscriber that falls behind skips the oldest
    /// pending batches rather than slowing the producer. Once the loop
    /// has exited, the returned stream is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotBatch> {
        let guard = self
            .batch_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Snapshot copy of the clone records for one original
    pub fn clones_of(&self, original_id: &str) -> Vec<CloneRecord> {
        self.registry.clones_of(original_id)
    }

    /// Current policy (copy)
    pub fn policy(&self) -> ClonePolicyConfig {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the scaling policy. Validation failures reject the update
    /// and keep the previous configuration; the new policy takes effect
    /// on the next tick. The accepted policy is persisted so it survives
    /// restarts.
    pub fn update_policy(&self, new_policy: ClonePolicyConfig) -> EngineResult<()> {
        new_policy.validate()?;

        {
            let mut current = self
                .policy
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = new_policy.clone();
        }
        info!(
            auto_scaling = new_policy.auto_scaling_enabled,
            cpu_threshold = new_policy.cpu_threshold_percent,
            memory_threshold = new_policy.memory_threshold_percent,
            "scaling policy updated"
        );

        // Persistence is best-effort; the runtime update already applied
        if let Some(path) = &self.policy_path {
            if let Err(e) = new_policy.save(path) {
                warn!(error = %e, "failed to persist policy update");
            }
        }
        Ok(())
    }

    /// Request a clone of the given container, bypassing the threshold
    /// check but honoring the cap and cooldown. Runs on the loop task;
    /// failures come back synchronously with the failing identity.
    pub async fn request_clone(&self, original_id: &str) -> EngineResult<ScalingEvent> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::RequestClone {
                original_id: original_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::unavailable("monitor loop has stopped"))?;

        reply_rx
            .await
            .map_err(|_| EngineError::unavailable("monitor loop has stopped"))?
    }

    /// Signal shutdown: the loop finishes its current work, exits, and
    /// closes the update channel so draining consumers unblock.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
