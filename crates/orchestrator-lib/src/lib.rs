//! Dependency-ordered provisioning orchestrator
//!
//! This crate provides the core functionality for:
//! - Declaring resource nodes and resolving them into staged application order
//! - Applying management actions exactly-effectively-once per idempotency key
//! - Sequencing the capacity migration after the service it moves
//! - Enforcing a hard lifetime on the whole deployment
//! - Health, status and observability for the deployment driver

pub mod action;
pub mod capacity;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod guard;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod scaling;
pub mod stack;
pub mod status;
pub mod trigger;

pub use action::{
    ActionInvoker, IdempotencyKeyStrategy, IdempotencyLedger, InvokerConfig, ManagementAction,
    RemoteActionClient, RetryPolicy,
};
pub use config::DeploymentConfig;
pub use engine::{DryRunActionClient, DryRunEngine, ResourceEngine};
pub use error::{ActionError, EngineError, ProvisionError, Result};
pub use graph::{ExecutionPlan, ResourceGraph};
pub use guard::{GuardState, LifetimeGuard};
pub use models::*;
pub use observability::{OrchestratorMetrics, StructuredLogger};
pub use orchestrator::{ApplyReport, NodeOutcome, Operation, Orchestrator, OrchestratorConfig};
pub use status::{ComponentStatus, DeploymentStatus, HealthResponse, ReadinessResponse};
