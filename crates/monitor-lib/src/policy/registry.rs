//! Clone lifecycle registry
//!
//! In-memory mapping from an original container's identity to its live
//! clones. Only the polling task mutates the registry (including
//! loop-executed manual clone commands); foreground callers read through
//! accessors that return snapshot copies, never live references.
//!
//! The registry is not persisted. After a restart it is rebuilt from the
//! provenance labels the clones carry, as a best-effort reconciliation.

use crate::models::{
    CloneRecord, ContainerDescriptor, LABEL_CLONE, LABEL_CREATED_AT, LABEL_ORIGINAL,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Registry of live clone records keyed by original container identity
#[derive(Debug, Default)]
pub struct CloneRegistry {
    /// original_id -> live clone records
    clones: DashMap<String, Vec<CloneRecord>>,
    /// original_id -> most recent successful clone creation, drives the
    /// cooldown window
    last_created: DashMap<String, DateTime<Utc>>,
}

impl CloneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully started clone. Also advances the cooldown
    /// reference point for its original.
    pub fn insert(&self, record: CloneRecord) {
        debug!(
            original_id = %record.original_id,
            clone_id = %record.clone_id,
            "registering clone"
        );
        let created_at = record.created_at;
        let original_id = record.original_id.clone();
        self.clones
            .entry(original_id.clone())
            .or_default()
            .push(record);

        let advance = self
            .last_created
            .get(&original_id)
            .map(|prev| *prev < created_at)
            .unwrap_or(true);
        if advance {
            self.last_created.insert(original_id, created_at);
        }
    }

    /// Drop the record for one clone container, returning it if present
    pub fn remove_clone(&self, clone_id: &str) -> Option<CloneRecord> {
        for mut entry in self.clones.iter_mut() {
            if let Some(pos) = entry.value().iter().position(|r| r.clone_id == clone_id) {
                return Some(entry.value_mut().remove(pos));
            }
        }
        None
    }

    /// Drop every record owned by an original, returning them for
    /// cascading removal of the underlying containers
    pub fn remove_original(&self, original_id: &str) -> Vec<CloneRecord> {
        self.last_created.remove(original_id);
        self.clones
            .remove(original_id)
            .map(|(_, records)| records)
            .unwrap_or_default()
    }

    /// Snapshot copy of the records for one original
    pub fn clones_of(&self, original_id: &str) -> Vec<CloneRecord> {
        self.clones
            .get(original_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Live clone count for one original
    pub fn count(&self, original_id: &str) -> usize {
        self.clones
            .get(original_id)
            .map(|r| r.value().len())
            .unwrap_or(0)
    }

    /// Most recent successful clone creation for one original
    pub fn last_created(&self, original_id: &str) -> Option<DateTime<Utc>> {
        self.last_created.get(original_id).map(|r| *r)
    }

    /// Identities that currently own at least one clone record
    pub fn originals(&self) -> Vec<String> {
        self.clones.iter().map(|r| r.key().clone()).collect()
    }

    /// Total live records across all originals
    pub fn total(&self) -> usize {
        self.clones.iter().map(|r| r.value().len()).sum()
    }

    /// Whether this container identity is a tracked clone
    pub fn is_tracked_clone(&self, container_id: &str) -> bool {
        self.clones
            .iter()
            .any(|entry| entry.value().iter().any(|r| r.clone_id == container_id))
    }

    /// Rebuild the registry from a container listing after a restart.
    ///
    /// Clone ownership is re-derived from the provenance labels
    /// (`clone=true`, `originalContainer`, `createdAt`). A clone whose
    /// labels were stripped is simply not reconstructed; this is a
    /// best-effort reconciliation, not a guaranteed-consistent ledger.
    pub fn reconcile(&self, listing: &[ContainerDescriptor]) {
        self.clones.clear();
        self.last_created.clear();

        let mut recovered = 0usize;
        for descriptor in listing {
            let is_clone = descriptor.labels.get(LABEL_CLONE).map(String::as_str) == Some("true");
            let Some(original_id) = descriptor.labels.get(LABEL_ORIGINAL) else {
                continue;
            };
            if !is_clone {
                continue;
            }

            let created_at = descriptor
                .labels
                .get(LABEL_CREATED_AT)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| {
                    warn!(
                        clone_id = %descriptor.id,
                        "clone is missing a parseable createdAt label, assuming now"
                    );
                    Utc::now()
                });

            self.insert(CloneRecord {
                clone_id: descriptor.id.clone(),
                clone_name: descriptor.name.clone(),
                original_id: original_id.clone(),
                created_at,
            });
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "reconstructed clone records from labels");
        }
    }
}
