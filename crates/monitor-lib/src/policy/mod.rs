//! Scaling policy: configuration, clone bookkeeping, and the decision
//! logic that turns metric breaches into clone containers.

mod config;
mod evaluator;
mod registry;

pub use config::ClonePolicyConfig;
pub use evaluator::{CloneDenied, ScalingEvaluator};
pub use registry::CloneRegistry;
