//! Core data models for the container monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label marking a container as eligible for auto-scaling
pub const LABEL_CLONEABLE: &str = "cloneable";
/// Label identifying a container as a clone created by this process
pub const LABEL_CLONE: &str = "clone";
/// Label carrying the identity of the cloned original
pub const LABEL_ORIGINAL: &str = "originalContainer";
/// Label carrying the clone creation timestamp (RFC 3339)
pub const LABEL_CREATED_AT: &str = "createdAt";
/// Provenance label attached to every container this process creates
pub const LABEL_MANAGED_BY: &str = "managedBy";
/// Value for [`LABEL_MANAGED_BY`]
pub const MANAGED_BY_VALUE: &str = "dockmon";

/// Container lifecycle state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    /// Parse an engine-reported state string. The engine API is loosely
    /// versioned, so unknown states fall back to `Created` rather than
    /// failing the whole listing.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Created,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Immutable per-tick view of one container. A fresh snapshot is built
/// every tick; nothing mutates across ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub labels: HashMap<String, String>,
}

impl ContainerSnapshot {
    /// Whether the container carries the cloneable marker
    pub fn is_cloneable(&self) -> bool {
        self.labels.get(LABEL_CLONEABLE).map(String::as_str) == Some("true")
    }

    /// Whether the container is a clone created by this process
    pub fn is_clone(&self) -> bool {
        self.labels.get(LABEL_CLONE).map(String::as_str) == Some("true")
            && self.labels.contains_key(LABEL_ORIGINAL)
    }

    /// Identity of the original this clone belongs to, if any
    pub fn original_id(&self) -> Option<&str> {
        if self.is_clone() {
            self.labels.get(LABEL_ORIGINAL).map(String::as_str)
        } else {
            None
        }
    }
}

/// One raw cumulative stats reading from the engine.
///
/// CPU percent is a derivative, so the polling loop pairs the current
/// reading with the previous tick's reading per identity. The previous
/// reading for the next tick is this tick's current one; no longer window
/// is retained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStatsSample {
    /// Cumulative container CPU usage in nanoseconds
    pub cpu_total_usage: u64,
    /// Cumulative host-wide CPU usage in nanoseconds
    pub system_cpu_usage: u64,
    /// Online CPU count as reported by the engine; 0 means unreported
    pub online_cpus: u32,
    /// Number of per-core usage entries, used as fallback when
    /// `online_cpus` is 0
    pub percpu_count: u32,
    /// Current memory usage in bytes
    pub memory_usage_bytes: u64,
    /// Memory limit in bytes; 0 means unlimited/unreported
    pub memory_limit_bytes: u64,
    /// Page cache bytes counted inside `memory_usage_bytes`
    pub memory_cache_bytes: u64,
}

/// Identity and labels of a container as returned by a listing call.
/// Stats and inspection are fetched separately per identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Configuration snapshot of an original container, copied onto its
/// clones: image, environment, command, volume binds and network mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneSource {
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
}

/// Tracks one clone container. Created when a clone starts successfully;
/// removed when the clone or its original is removed. Never mutated in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneRecord {
    pub clone_id: String,
    pub clone_name: String,
    pub original_id: String,
    pub created_at: DateTime<Utc>,
}

/// Scaling activity that happened during one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingEvent {
    CloneCreated {
        original_id: String,
        clone_id: String,
        clone_name: String,
    },
    CloneFailed {
        original_id: String,
        reason: String,
    },
    /// An original disappeared and its clones were cascaded away
    ClonesReaped {
        original_id: String,
        reaped: usize,
    },
}

/// Full output of one polling tick, pushed onto the update channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBatch {
    /// Monotonic tick sequence number
    pub tick: u64,
    pub captured_at: DateTime<Utc>,
    /// Current engine reachability; consumers surface this as a
    /// persistent status indicator
    pub engine_reachable: bool,
    pub containers: Vec<ContainerSnapshot>,
    pub events: Vec<ScalingEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(pairs: &[(&str, &str)]) -> ContainerSnapshot {
        ContainerSnapshot {
            id: "c1".into(),
            name: "web".into(),
            state: ContainerState::Running,
            cpu_percent: 0.0,
            memory_used_mb: 0.0,
            memory_limit_bytes: 0,
            memory_percent: 0.0,
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn state_parsing_is_lenient() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("dead"), ContainerState::Dead);
        assert_eq!(ContainerState::parse("warming-up"), ContainerState::Created);
    }

    #[test]
    fn cloneable_marker_detection() {
        assert!(labeled(&[(LABEL_CLONEABLE, "true")]).is_cloneable());
        assert!(!labeled(&[(LABEL_CLONEABLE, "false")]).is_cloneable());
        assert!(!labeled(&[]).is_cloneable());
    }

    #[test]
    fn clone_provenance_requires_both_labels() {
        let full = labeled(&[(LABEL_CLONE, "true"), (LABEL_ORIGINAL, "orig-1")]);
        assert!(full.is_clone());
        assert_eq!(full.original_id(), Some("orig-1"));

        // A stripped originalContainer label must not classify as a clone
        let partial = labeled(&[(LABEL_CLONE, "true")]);
        assert!(!partial.is_clone());
        assert_eq!(partial.original_id(), None);
    }
}
