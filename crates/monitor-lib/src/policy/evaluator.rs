//! Scaling decision logic
//!
//! Per original container the evaluator walks `Idle → Eligible →
//! ClonePending → Cooldown → Idle`. The states are not stored anywhere;
//! they fall out of the guards below evaluated against the registry and
//! the current tick's metrics. A clone-creation failure deliberately does
//! not start the cooldown, so a transient engine error can be retried on
//! the next tick while conditions still hold.

use crate::error::EngineError;
use crate::gateway::EngineGateway;
use crate::host::HostResources;
use crate::models::{
    CloneRecord, ContainerSnapshot, ScalingEvent, LABEL_CLONE, LABEL_CREATED_AT, LABEL_MANAGED_BY,
    LABEL_ORIGINAL, MANAGED_BY_VALUE,
};
use crate::policy::{ClonePolicyConfig, CloneRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a clone was not created this tick
#[derive(Debug, Clone, PartialEq)]
pub enum CloneDenied {
    ScalingDisabled,
    NotRunning,
    /// The container is itself a clone; clones are never re-cloned
    IsClone,
    /// The container does not carry the cloneable marker
    NotCloneable,
    BelowThresholds,
    CapReached {
        live: usize,
        cap: u32,
    },
    CoolingDown {
        remaining_secs: u64,
    },
    HostMemoryLow {
        free_bytes: u64,
        required_bytes: u64,
    },
    HostCpuLow {
        free_percent: f64,
        required_percent: f64,
    },
}

impl std::fmt::Display for CloneDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloneDenied::ScalingDisabled => write!(f, "auto-scaling is disabled"),
            CloneDenied::NotRunning => write!(f, "container is not running"),
            CloneDenied::IsClone => write!(f, "container is itself a clone"),
            CloneDenied::NotCloneable => write!(f, "container is not marked cloneable"),
            CloneDenied::BelowThresholds => write!(f, "metrics are below thresholds"),
            CloneDenied::CapReached { live, cap } => {
                write!(f, "clone cap reached ({live}/{cap})")
            }
            CloneDenied::CoolingDown { remaining_secs } => {
                write!(f, "cooling down for another {remaining_secs}s")
            }
            CloneDenied::HostMemoryLow {
                free_bytes,
                required_bytes,
            } => write!(
                f,
                "host memory too low ({free_bytes} free, {required_bytes} required)"
            ),
            CloneDenied::HostCpuLow {
                free_percent,
                required_percent,
            } => write!(
                f,
                "host cpu too low ({free_percent:.1}% free, {required_percent:.1}% required)"
            ),
        }
    }
}

/// Evaluates the scaling policy and drives clone creation and cleanup
pub struct ScalingEvaluator {
    gateway: Arc<dyn EngineGateway>,
    registry: Arc<CloneRegistry>,
}

impl ScalingEvaluator {
    pub fn new(gateway: Arc<dyn EngineGateway>, registry: Arc<CloneRegistry>) -> Self {
        Self { gateway, registry }
    }

    pub fn registry(&self) -> &Arc<CloneRegistry> {
        &self.registry
    }

    /// Evaluate one container for automatic scaling. Returns the scaling
    /// event for the tick, if any. Never propagates an error: a failure
    /// here must not abort evaluation of the other containers.
    pub async fn evaluate(
        &self,
        snapshot: &ContainerSnapshot,
        policy: &ClonePolicyConfig,
        host: HostResources,
    ) -> Option<ScalingEvent> {
        if let Err(denied) = self.clone_guard(snapshot, policy, host, false) {
            match denied {
                // The quiet steady-state outcomes stay at trace level
                CloneDenied::BelowThresholds
                | CloneDenied::ScalingDisabled
                | CloneDenied::IsClone
                | CloneDenied::NotRunning
                | CloneDenied::NotCloneable => {}
                interesting => {
                    debug!(
                        container = %snapshot.name,
                        reason = %interesting,
                        "overloaded container not cloned"
                    );
                }
            }
            return None;
        }

        info!(
            container = %snapshot.name,
            cpu_percent = snapshot.cpu_percent,
            memory_percent = snapshot.memory_percent,
            "container overloaded, creating clone"
        );

        Some(self.attempt_clone(snapshot).await)
    }

    /// Manually requested clone, bypassing the threshold and enablement
    /// checks but still honoring the cap and cooldown. Host admission is
    /// also skipped: the request carries explicit user intent.
    pub async fn request_clone(
        &self,
        snapshot: &ContainerSnapshot,
        policy: &ClonePolicyConfig,
    ) -> Result<ScalingEvent, CloneDenied> {
        let unchecked_host = HostResources {
            free_memory_bytes: u64::MAX,
            free_cpu_percent: 100.0,
        };
        self.clone_guard(snapshot, policy, unchecked_host, true)?;
        Ok(self.attempt_clone(snapshot).await)
    }

    /// All guards between `Eligible` and `ClonePending`
    fn clone_guard(
        &self,
        snapshot: &ContainerSnapshot,
        policy: &ClonePolicyConfig,
        host: HostResources,
        manual: bool,
    ) -> Result<(), CloneDenied> {
        if snapshot.is_clone() {
            return Err(CloneDenied::IsClone);
        }
        if !snapshot.state.is_running() {
            return Err(CloneDenied::NotRunning);
        }

        if !manual {
            if !policy.auto_scaling_enabled {
                return Err(CloneDenied::ScalingDisabled);
            }
            if !snapshot.is_cloneable() {
                return Err(CloneDenied::NotCloneable);
            }
            let breached = snapshot.cpu_percent > policy.cpu_threshold_percent
                || snapshot.memory_percent > policy.memory_threshold_percent;
            if !breached {
                return Err(CloneDenied::BelowThresholds);
            }
        }

        let live = self.registry.count(&snapshot.id);
        if live >= policy.max_clones_per_original as usize {
            return Err(CloneDenied::CapReached {
                live,
                cap: policy.max_clones_per_original,
            });
        }

        if let Some(last) = self.registry.last_created(&snapshot.id) {
            let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
            if elapsed < policy.clone_cooldown_seconds {
                return Err(CloneDenied::CoolingDown {
                    remaining_secs: policy.clone_cooldown_seconds - elapsed,
                });
            }
        }

        if host.free_memory_bytes < policy.min_free_memory_bytes {
            return Err(CloneDenied::HostMemoryLow {
                free_bytes: host.free_memory_bytes,
                required_bytes: policy.min_free_memory_bytes,
            });
        }
        if host.free_cpu_percent < policy.min_free_cpu_percent {
            return Err(CloneDenied::HostCpuLow {
                free_percent: host.free_cpu_percent,
                required_percent: policy.min_free_cpu_percent,
            });
        }

        Ok(())
    }

    /// Create and start one clone of the given original. A success
    /// registers the record (which starts the cooldown); a failure is
    /// reported as an event and leaves the cooldown untouched.
    async fn attempt_clone(&self, snapshot: &ContainerSnapshot) -> ScalingEvent {
        let created_at = Utc::now();
        let clone_name = format!(
            "{}-clone-{}",
            snapshot.name,
            created_at.timestamp_millis()
        );

        let mut labels = HashMap::new();
        labels.insert(LABEL_CLONE.to_string(), "true".to_string());
        labels.insert(LABEL_ORIGINAL.to_string(), snapshot.id.clone());
        labels.insert(LABEL_CREATED_AT.to_string(), created_at.to_rfc3339());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());

        let source = match self.gateway.inspect_source(&snapshot.id).await {
            Ok(source) => source,
            Err(e) => {
                warn!(container = %snapshot.name, error = %e, "failed to inspect clone source");
                return ScalingEvent::CloneFailed {
                    original_id: snapshot.id.clone(),
                    reason: e.to_string(),
                };
            }
        };

        match self
            .gateway
            .create_clone(&source, &clone_name, labels)
            .await
        {
            Ok(clone_id) => {
                self.registry.insert(CloneRecord {
                    clone_id: clone_id.clone(),
                    clone_name: clone_name.clone(),
                    original_id: snapshot.id.clone(),
                    created_at,
                });
                info!(
                    original = %snapshot.name,
                    clone = %clone_name,
                    clone_id = %clone_id,
                    "clone created"
                );
                ScalingEvent::CloneCreated {
                    original_id: snapshot.id.clone(),
                    clone_id,
                    clone_name,
                }
            }
            Err(e) => {
                warn!(original = %snapshot.name, error = %e, "clone creation failed");
                ScalingEvent::CloneFailed {
                    original_id: snapshot.id.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Cascade cleanup when an original container has disappeared: stop
    /// and remove every clone it owned, then drop the records. The only
    /// cascading delete in the system.
    pub async fn reap_clones_of(&self, original_id: &str) -> Option<ScalingEvent> {
        let records = self.registry.remove_original(original_id);
        if records.is_empty() {
            return None;
        }

        let mut reaped = 0usize;
        for record in &records {
            match self.gateway.stop_and_remove(&record.clone_id, true).await {
                Ok(()) => {
                    reaped += 1;
                    info!(
                        original_id = %original_id,
                        clone_id = %record.clone_id,
                        "removed orphaned clone"
                    );
                }
                Err(EngineError::ContainerGone { .. }) => {
                    reaped += 1;
                }
                Err(e) => {
                    warn!(
                        original_id = %original_id,
                        clone_id = %record.clone_id,
                        error = %e,
                        "failed to remove orphaned clone"
                    );
                }
            }
        }

        Some(ScalingEvent::ClonesReaped {
            original_id: original_id.to_string(),
            reaped,
        })
    }
}
