//! dockmon - Single-host container resource monitor and auto-scaler
//!
//! This binary polls the local container engine for per-container
//! CPU/memory usage, scales overloaded containers out by cloning them,
//! and serves health, metrics, and control endpoints over HTTP.

use anyhow::Result;
use dockmon_lib::{
    gateway::DockerGateway,
    gateway::GatewayConfig,
    health::{components, HealthRegistry},
    host::SysinfoSampler,
    observability::MonitorMetrics,
    ClonePolicyConfig, MonitorConfig, MonitorLoop,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting dockmon");

    // Load configuration
    let app_config = config::MonitorAppConfig::load()?;
    info!(
        poll_interval_secs = app_config.poll_interval_secs,
        api_port = app_config.api_port,
        "Monitor configured"
    );

    // Load the persisted scaling policy; a corrupt file falls back to
    // defaults rather than blocking startup
    let policy_path = app_config
        .policy_path
        .as_ref()
        .map(std::path::PathBuf::from)
        .or_else(ClonePolicyConfig::default_path);

    let policy = match &policy_path {
        Some(path) => match ClonePolicyConfig::load(path) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load policy, using defaults");
                ClonePolicyConfig::default()
            }
        },
        None => ClonePolicyConfig::default(),
    };

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::POLLER).await;

    // Initialize metrics
    let metrics = MonitorMetrics::new();

    // Build the engine gateway and the polling loop
    let gateway = Arc::new(DockerGateway::new(GatewayConfig {
        call_timeout: Duration::from_secs(app_config.engine_timeout_secs),
        ..GatewayConfig::default()
    }));

    let monitor_config = MonitorConfig {
        poll_interval: Duration::from_secs(app_config.poll_interval_secs.max(1)),
        include_stopped: app_config.include_stopped,
        ..MonitorConfig::default()
    };

    let (monitor_loop, mut handle) =
        MonitorLoop::new(gateway, Box::new(SysinfoSampler::new()), policy, monitor_config);
    if let Some(path) = policy_path {
        handle = handle.with_policy_path(path);
    }

    let loop_task = tokio::spawn(monitor_loop.run());

    // Drain the update channel into the health registry so /healthz
    // reflects engine reachability without the loop knowing about HTTP
    let drain_registry = health_registry.clone();
    let mut batches = handle.subscribe();
    let drain_task = tokio::spawn(async move {
        loop {
            match batches.recv().await {
                Ok(batch) => {
                    if batch.engine_reachable {
                        drain_registry.set_healthy(components::ENGINE).await;
                    } else {
                        drain_registry
                            .set_degraded(components::ENGINE, "engine unreachable")
                            .await;
                    }
                    drain_registry.set_healthy(components::POLLER).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Update channel consumer lagged, skipping batches");
                }
                Err(RecvError::Closed) => break,
            }
        }
        drain_registry
            .set_unhealthy(components::POLLER, "polling loop stopped")
            .await;
    });

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        handle.clone(),
    ));

    // Mark the monitor as ready after initialization
    health_registry.set_ready(true).await;

    // Start the health, metrics, and control server
    tokio::spawn(api::serve(app_config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    health_registry.set_ready(false).await;
    handle.shutdown();
    let _ = loop_task.await;
    let _ = drain_task.await;

    info!("Shutdown complete");
    Ok(())
}
