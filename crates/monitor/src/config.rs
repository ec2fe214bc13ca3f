//! Monitor configuration

use anyhow::Result;
use serde::Deserialize;

/// Monitor process configuration, read from `DOCKMON_*` environment
/// variables. The scaling policy lives in its own persisted file; this
/// covers only the process-level knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorAppConfig {
    /// API server port for health/metrics/control
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Whether stopped containers appear in snapshot batches
    #[serde(default = "default_include_stopped")]
    pub include_stopped: bool,

    /// Upper bound on any single engine call, in seconds
    #[serde(default = "default_engine_timeout")]
    pub engine_timeout_secs: u64,

    /// Override for the persisted policy file location
    #[serde(default)]
    pub policy_path: Option<String>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    2
}

fn default_include_stopped() -> bool {
    true
}

fn default_engine_timeout() -> u64 {
    8
}

impl Default for MonitorAppConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            poll_interval_secs: default_poll_interval(),
            include_stopped: default_include_stopped(),
            engine_timeout_secs: default_engine_timeout(),
            policy_path: None,
        }
    }
}

impl MonitorAppConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DOCKMON"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = MonitorAppConfig::default();
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.api_port, 8080);
        assert!(config.include_stopped);
        assert!(config.policy_path.is_none());
    }
}
