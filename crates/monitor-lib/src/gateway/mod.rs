//! Engine client gateway
//!
//! All engine traffic goes through one gateway object constructed at
//! process start and passed explicitly to the polling loop and to
//! foreground handlers. The trait seam keeps the policy and loop logic
//! testable against a fake engine.

mod docker;

pub use docker::{DockerGateway, GatewayConfig};

use crate::error::EngineResult;
use crate::models::{CloneSource, ContainerDescriptor, RawStatsSample};
use std::collections::HashMap;

pub use async_trait::async_trait;

/// Operations the monitor needs from the container engine.
///
/// The gateway is safe for concurrent use by the polling loop and by
/// user-initiated foreground actions; the underlying client handle is
/// constructed exactly once.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Liveness check against the engine daemon
    async fn ping(&self) -> EngineResult<()>;

    /// List containers. An empty result is not an error. Returns
    /// `EngineUnavailable` if the connection has died since last use.
    async fn list_containers(&self, include_stopped: bool)
        -> EngineResult<Vec<ContainerDescriptor>>;

    /// Fetch one raw cumulative stats reading. Returns `ContainerGone`
    /// when the container vanished between listing and stating; the
    /// caller skips that container for the tick.
    async fn fetch_raw_stats(&self, id: &str) -> EngineResult<RawStatsSample>;

    /// Snapshot the configuration of a container for cloning
    async fn inspect_source(&self, id: &str) -> EngineResult<CloneSource>;

    /// Create and start a container copying `source`, with the given name
    /// and labels. Returns the new container's engine-assigned identity.
    /// Fails with `CloneCreationFailed` on any engine error; never
    /// retried automatically.
    async fn create_clone(
        &self,
        source: &CloneSource,
        name: &str,
        labels: HashMap<String, String>,
    ) -> EngineResult<String>;

    /// Best-effort stop and remove. A `ContainerGone` from the engine is
    /// treated as success (idempotent delete).
    async fn stop_and_remove(&self, id: &str, force: bool) -> EngineResult<()>;
}
