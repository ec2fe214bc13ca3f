//! Error taxonomy for the monitoring subsystem
//!
//! Every engine-facing operation maps its failures into one of these
//! variants so callers can apply the right recovery policy:
//! retry next tick, skip the container, report without retrying, or
//! reject at the update boundary.

use thiserror::Error;

/// Errors surfaced by the engine gateway and policy layer
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine daemon/socket is unreachable or the call timed out.
    /// Recoverable: the polling loop keeps ticking and retries next tick.
    #[error("container engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    /// The container disappeared between listing and the operation.
    /// Recoverable: skip this container for the current tick.
    #[error("container {id} no longer exists")]
    ContainerGone { id: String },

    /// Clone creation was rejected by the engine (name collision, port
    /// conflict, resource limits). Reported to the consumer, not retried
    /// automatically.
    #[error("failed to create clone {name}: {reason}")]
    CloneCreationFailed { name: String, reason: String },

    /// A policy value was out of range. Rejected at the update boundary;
    /// the previous valid configuration stays in effect.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

impl EngineError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            reason: reason.into(),
        }
    }

    pub fn gone(id: impl Into<String>) -> Self {
        Self::ContainerGone { id: id.into() }
    }

    pub fn clone_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CloneCreationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True when the failure is expected to clear on its own without
    /// operator intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::EngineUnavailable { .. } | EngineError::ContainerGone { .. }
        )
    }
}

/// Result alias used throughout the library
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(EngineError::unavailable("socket closed").is_recoverable());
        assert!(EngineError::gone("abc123").is_recoverable());
        assert!(!EngineError::clone_failed("web-clone-1", "name in use").is_recoverable());
        assert!(!EngineError::ConfigurationInvalid("cpu threshold".into()).is_recoverable());
    }

    #[test]
    fn display_includes_identity() {
        let err = EngineError::gone("deadbeef");
        assert!(err.to_string().contains("deadbeef"));

        let err = EngineError::clone_failed("web-clone-1", "409 name in use");
        let msg = err.to_string();
        assert!(msg.contains("web-clone-1"));
        assert!(msg.contains("409"));
    }
}
