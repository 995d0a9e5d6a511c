//! Cost optimization operator library
//!
//! This crate provides the core functionality for:
//! - Utilization statistics and the recommendation engine
//! - Policy validation and pre-apply gating
//! - Safe apply with redundant rollback records
//! - The reconciliation controller and leader lease
//! - Health checks and observability

pub mod controller;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod health;
pub mod inventory;
pub mod models;
pub mod observability;
pub mod pricing;
pub mod rollback;
pub mod units;
pub mod utilization;
pub mod workload;

pub use error::{ErrorClass, OptimizerError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
