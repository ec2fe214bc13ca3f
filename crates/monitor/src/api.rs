//! HTTP API for health checks, Prometheus metrics, and scaling control

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use dockmon_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::MonitorMetrics,
    ClonePolicyConfig, EngineError, MonitorHandle,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: MonitorMetrics,
    pub monitor: MonitorHandle,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: MonitorMetrics,
        monitor: MonitorHandle,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            monitor,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// List the tracked clones of an original container
async fn list_clones(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let clones = state.monitor.clones_of(&id);
    (StatusCode::OK, Json(clones))
}

/// Trigger a manual clone of a container
async fn create_clone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.monitor.request_clone(&id).await {
        Ok(event) => (StatusCode::CREATED, Json(json!({ "event": event }))),
        Err(e) => (engine_error_status(&e), Json(json!({ "error": e.to_string() }))),
    }
}

/// Fetch the active scaling policy
async fn get_policy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.monitor.policy()))
}

/// Replace the active scaling policy. Invalid policies are rejected and
/// the previous one stays in effect.
async fn put_policy(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<ClonePolicyConfig>,
) -> impl IntoResponse {
    match state.monitor.update_policy(policy) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "applied" }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

fn engine_error_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::ContainerGone { .. } => StatusCode::NOT_FOUND,
        EngineError::CloneCreationFailed { .. } => StatusCode::CONFLICT,
        EngineError::ConfigurationInvalid(_) => StatusCode::BAD_REQUEST,
        EngineError::EngineUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/clones/:id", get(list_clones).post(create_clone))
        .route("/policy", put(put_policy).get(get_policy))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
