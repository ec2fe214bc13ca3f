//! Docker engine gateway over bollard
//!
//! Holds the single engine connection for the process lifetime. The
//! handle is initialized lazily on first use and shared by every caller;
//! bollard's client is internally cheap to share, so no extra locking is
//! needed beyond constructing it exactly once.

use super::EngineGateway;
use crate::error::{EngineError, EngineResult};
use crate::models::{CloneSource, ContainerDescriptor, ContainerState, RawStatsSample};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, MemoryStatsStats,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Gateway tuning knobs
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on any single engine call
    pub call_timeout: Duration,
    /// Grace period given to a container on stop before the kill
    pub stop_timeout_secs: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(8),
            stop_timeout_secs: 10,
        }
    }
}

/// The process-wide Docker gateway
pub struct DockerGateway {
    handle: OnceCell<Docker>,
    config: GatewayConfig,
}

impl DockerGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            handle: OnceCell::new(),
            config,
        }
    }

    /// Get the shared client handle, connecting and pinging on first use
    async fn handle(&self) -> EngineResult<&Docker> {
        self.handle
            .get_or_try_init(|| async {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|e| EngineError::unavailable(e.to_string()))?;

                match timeout(self.config.call_timeout, docker.ping()).await {
                    Ok(Ok(_)) => {
                        info!("engine connection established");
                        Ok(docker)
                    }
                    Ok(Err(e)) => Err(EngineError::unavailable(e.to_string())),
                    Err(_) => Err(EngineError::unavailable("ping timed out")),
                }
            })
            .await
    }

    /// Run one engine call under the configured timeout
    async fn call<T, F>(&self, id: Option<&str>, fut: F) -> EngineResult<T>
    where
        F: Future<Output = Result<T, BollardError>>,
    {
        match timeout(self.config.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(map_engine_err(id, e)),
            Err(_) => Err(EngineError::unavailable(format!(
                "engine call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }
}

/// Translate a bollard error into the gateway taxonomy. A 404 means the
/// container vanished between listing and the operation.
fn map_engine_err(id: Option<&str>, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::gone(id.unwrap_or("unknown")),
        other => EngineError::unavailable(other.to_string()),
    }
}

#[async_trait]
impl EngineGateway for DockerGateway {
    async fn ping(&self) -> EngineResult<()> {
        let docker = self.handle().await?;
        self.call(None, docker.ping()).await.map(|_| ())
    }

    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> EngineResult<Vec<ContainerDescriptor>> {
        let docker = self.handle().await?;
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };

        let summaries = self.call(None, docker.list_containers(Some(options))).await?;

        let descriptors = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerDescriptor {
                    id,
                    name,
                    state: summary
                        .state
                        .as_deref()
                        .map(ContainerState::parse)
                        .unwrap_or(ContainerState::Created),
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect();

        Ok(descriptors)
    }

    async fn fetch_raw_stats(&self, id: &str) -> EngineResult<RawStatsSample> {
        let docker = self.handle().await?;
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = docker.stats(id, Some(options));
        let stats = match timeout(self.config.call_timeout, stream.next()).await {
            Ok(Some(Ok(stats))) => stats,
            Ok(Some(Err(e))) => return Err(map_engine_err(Some(id), e)),
            Ok(None) => return Err(EngineError::gone(id)),
            Err(_) => {
                return Err(EngineError::unavailable(format!(
                    "stats call for {id} timed out"
                )))
            }
        };

        let cache = match stats.memory_stats.stats {
            Some(MemoryStatsStats::V1(v1)) => v1.cache,
            // cgroup v2 has no direct cache counter; inactive_file is the
            // reclaimable portion the engine CLI subtracts as well
            Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
            None => 0,
        };

        Ok(RawStatsSample {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(0) as u32,
            percpu_count: stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u32)
                .unwrap_or(0),
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            memory_cache_bytes: cache,
        })
    }

    async fn inspect_source(&self, id: &str) -> EngineResult<CloneSource> {
        let docker = self.handle().await?;
        let inspect = self
            .call(Some(id), docker.inspect_container(id, None))
            .await?;

        let config = inspect.config.unwrap_or_default();
        let host_config = inspect.host_config.unwrap_or_default();

        let image = config
            .image
            .ok_or_else(|| EngineError::gone(id))?;

        Ok(CloneSource {
            image,
            env: config.env.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            binds: host_config.binds.unwrap_or_default(),
            network_mode: host_config.network_mode,
        })
    }

    async fn create_clone(
        &self,
        source: &CloneSource,
        name: &str,
        labels: HashMap<String, String>,
    ) -> EngineResult<String> {
        let docker = self
            .handle()
            .await
            .map_err(|e| EngineError::clone_failed(name, e.to_string()))?;

        let config = Config::<String> {
            image: Some(source.image.clone()),
            env: (!source.env.is_empty()).then(|| source.env.clone()),
            cmd: (!source.cmd.is_empty()).then(|| source.cmd.clone()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: (!source.binds.is_empty()).then(|| source.binds.clone()),
                network_mode: source.network_mode.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let created = self
            .call(None, docker.create_container(Some(options), config))
            .await
            .map_err(|e| EngineError::clone_failed(name, e.to_string()))?;

        if let Err(e) = self
            .call(
                Some(&created.id),
                docker.start_container(&created.id, None::<StartContainerOptions<String>>),
            )
            .await
        {
            // Don't leave a created-but-never-started container behind
            warn!(clone = %name, error = %e, "clone start failed, removing created container");
            let _ = self
                .call(
                    Some(&created.id),
                    docker.remove_container(
                        &created.id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    ),
                )
                .await;
            return Err(EngineError::clone_failed(name, e.to_string()));
        }

        Ok(created.id)
    }

    async fn stop_and_remove(&self, id: &str, force: bool) -> EngineResult<()> {
        let docker = self.handle().await?;

        let stop = timeout(
            self.config.call_timeout,
            docker.stop_container(
                id,
                Some(StopContainerOptions {
                    t: self.config.stop_timeout_secs,
                }),
            ),
        )
        .await;

        match stop {
            Ok(Ok(())) => {}
            // Already gone counts as success for an idempotent delete
            Ok(Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            })) => {
                debug!(container_id = %id, "container already gone before stop");
                return Ok(());
            }
            // 304: already stopped, proceed to removal
            Ok(Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            })) => {}
            Ok(Err(e)) if force => {
                debug!(container_id = %id, error = %e, "stop failed, forcing removal");
            }
            Ok(Err(e)) => return Err(map_engine_err(Some(id), e)),
            Err(_) if force => {
                debug!(container_id = %id, "stop timed out, forcing removal");
            }
            Err(_) => return Err(EngineError::unavailable(format!("stop of {id} timed out"))),
        }

        let removed = self
            .call(
                Some(id),
                docker.remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force,
                        ..Default::default()
                    }),
                ),
            )
            .await;

        match removed {
            Ok(()) | Err(EngineError::ContainerGone { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_404_to_container_gone() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        match map_engine_err(Some("abc"), err) {
            EngineError::ContainerGone { id } => assert_eq!(id, "abc"),
            other => panic!("expected ContainerGone, got {other:?}"),
        }
    }

    #[test]
    fn maps_server_errors_to_unavailable() {
        let err = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "internal".into(),
        };
        assert!(matches!(
            map_engine_err(None, err),
            EngineError::EngineUnavailable { .. }
        ));
    }
}
