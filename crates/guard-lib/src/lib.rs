//! Network flow anomaly response
//!
//! This crate provides the core functionality for:
//! - Flow table preprocessing into finite feature vectors
//! - Binary attack classification behind a swappable model
//! - Per-source violation tracking and timed bans
//! - Firewall enforcement with retry and reconciliation
//! - Health checks and observability

pub mod classifier;
pub mod enforcement;
pub mod error;
pub mod firewall;
pub mod health;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod preprocess;
pub mod tracker;

pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{GuardMetrics, StructuredLogger};
