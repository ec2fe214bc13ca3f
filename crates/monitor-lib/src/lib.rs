//! Library for the container resource monitor and auto-scaling controller
//!
//! This crate provides the core functionality for:
//! - A single-handle gateway to the container engine
//! - Normalized CPU/memory metric computation from raw counters
//! - The scaling policy evaluator and clone lifecycle registry
//! - The tick-driven polling loop and its update channel
//! - Health checks and observability

pub mod error;
pub mod gateway;
pub mod health;
pub mod host;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod policy;

pub use error::{EngineError, EngineResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitorConfig, MonitorHandle, MonitorLoop};
pub use observability::MonitorMetrics;
pub use policy::{ClonePolicyConfig, CloneRegistry, ScalingEvaluator};
