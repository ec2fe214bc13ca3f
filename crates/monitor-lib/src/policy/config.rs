//! Scaling policy configuration
//!
//! The policy is the only state that survives a process restart. It is
//! persisted as JSON at a per-user configuration path and may be replaced
//! at runtime; the polling loop reads one snapshot per tick, so an update
//! takes effect on the next tick, never mid-tick.

use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime scaling policy. Last writer wins; reads are copy-on-read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClonePolicyConfig {
    /// CPU percent above which a container is considered overloaded
    pub cpu_threshold_percent: f64,
    /// Memory percent above which a container is considered overloaded
    pub memory_threshold_percent: f64,
    /// Master switch; clones are never created automatically while false
    pub auto_scaling_enabled: bool,
    /// Cap on live clones per original container
    pub max_clones_per_original: u32,
    /// Minimum seconds between successful clone creations per original
    pub clone_cooldown_seconds: u64,
    /// Clones are not created while host free memory is below this
    pub min_free_memory_bytes: u64,
    /// Clones are not created while host free CPU is below this percent
    pub min_free_cpu_percent: f64,
}

impl Default for ClonePolicyConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 80.0,
            memory_threshold_percent: 80.0,
            // Off by default: clone creation must be an explicit opt-in
            auto_scaling_enabled: false,
            max_clones_per_original: 2,
            clone_cooldown_seconds: 60,
            min_free_memory_bytes: 256 * 1024 * 1024,
            min_free_cpu_percent: 10.0,
        }
    }
}

impl ClonePolicyConfig {
    /// Validate ranges. Called at every update boundary; on failure the
    /// previous valid configuration stays in effect.
    pub fn validate(&self) -> EngineResult<()> {
        fn in_percent_range(name: &str, v: f64) -> EngineResult<()> {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(EngineError::ConfigurationInvalid(format!(
                    "{name} must be between 0 and 100, got {v}"
                )));
            }
            Ok(())
        }

        in_percent_range("cpu_threshold_percent", self.cpu_threshold_percent)?;
        in_percent_range("memory_threshold_percent", self.memory_threshold_percent)?;
        in_percent_range("min_free_cpu_percent", self.min_free_cpu_percent)?;
        Ok(())
    }

    /// Default persistence location: `<config_dir>/dockmon/policy.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join("dockmon").join("policy.json"))
    }

    /// Load from disk. A missing file yields the defaults; a present but
    /// invalid file is an error rather than silently reverting.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        let policy: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse policy file {}", path.display()))?;
        policy
            .validate()
            .with_context(|| format!("policy file {} holds invalid values", path.display()))?;
        Ok(policy)
    }

    /// Persist to disk, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("failed to serialize policy")?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write policy file {}", path.display()))?;
        Ok(())
    }
}
