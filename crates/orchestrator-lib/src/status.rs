//! Deployment status registry
//!
//! Tracks the last provisioning and teardown reports together with the
//! lifetime guard, and derives health and readiness from them for the
//! driver's health endpoints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::guard::{GuardState, LifetimeGuard};
use crate::models::NodeId;
use crate::orchestrator::{ApplyReport, Operation};
use crate::stack;

/// Health of the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Running, but a run was partial or the service is off its intended capacity
    Degraded,
    /// Teardown could not remove every node
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub guard: GuardState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Point-in-time view served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub stack: String,
    pub guard: GuardState,
    pub ttl_secs: u64,
    pub installed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub load_balancer_dns: Option<String>,
    pub capacity_degraded: Vec<NodeId>,
    pub teardown_failing: Vec<NodeId>,
    pub last_provision: Option<ApplyReport>,
    pub last_teardown: Option<ApplyReport>,
}

#[derive(Debug, Default)]
struct StatusState {
    last_provision: Option<ApplyReport>,
    last_teardown: Option<ApplyReport>,
    capacity_degraded: Vec<NodeId>,
}

#[derive(Clone)]
pub struct DeploymentStatus {
    stack: String,
    guard: Arc<LifetimeGuard>,
    state: Arc<RwLock<StatusState>>,
}

impl DeploymentStatus {
    pub fn new(stack: impl Into<String>, guard: Arc<LifetimeGuard>) -> Self {
        Self {
            stack: stack.into(),
            guard,
            state: Arc::new(RwLock::new(StatusState::default())),
        }
    }

    /// Keep the latest report for its operation
    pub async fn record_report(&self, report: &ApplyReport) {
        let mut state = self.state.write().await;
        match report.operation {
            Operation::Provision => state.last_provision = Some(report.clone()),
            Operation::Teardown => state.last_teardown = Some(report.clone()),
        }
    }

    pub async fn set_capacity_degraded(&self, nodes: Vec<NodeId>) {
        self.state.write().await.capacity_degraded = nodes;
    }

    pub async fn health(&self) -> HealthResponse {
        let guard = self.guard.state().await;
        let failing = self.guard.failing().await;
        let state = self.state.read().await;

        let mut issues = Vec::new();
        if !failing.is_empty() {
            issues.push(format!("teardown incomplete: {:?}", failing));
            return HealthResponse {
                status: ComponentStatus::Unhealthy,
                guard,
                issues,
            };
        }

        if let Some(report) = state.last_provision.as_ref().filter(|r| !r.is_complete()) {
            issues.push(format!("partial provisioning: {}", report.summary()));
        }
        if !state.capacity_degraded.is_empty() {
            issues.push(format!(
                "capacity migration incomplete: {:?}",
                state.capacity_degraded
            ));
        }

        let status = if issues.is_empty() {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Degraded
        };
        HealthResponse {
            status,
            guard,
            issues,
        }
    }

    /// Ready once provisioning completed and the guard is active
    pub async fn readiness(&self) -> ReadinessResponse {
        let guard = self.guard.state().await;
        let state = self.state.read().await;

        let reason = match (&state.last_provision, guard) {
            (None, _) => Some("Deployment not yet provisioned".to_string()),
            (Some(report), _) if !report.is_complete() => {
                Some(format!("Provisioning incomplete: {}", report.summary()))
            }
            (_, GuardState::Active) => None,
            (_, other) => Some(format!("Lifetime guard is {}", other)),
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let guard = self.guard.state().await;
        let installed_at = self.guard.installed_at().await;
        let expires_at = self.guard.expires_at().await;
        let teardown_failing = self.guard.failing().await;
        let state = self.state.read().await;

        StatusSnapshot {
            stack: self.stack.clone(),
            guard,
            ttl_secs: self.guard.ttl().as_secs(),
            installed_at,
            expires_at,
            load_balancer_dns: state
                .last_provision
                .as_ref()
                .and_then(stack::load_balancer_dns),
            capacity_degraded: state.capacity_degraded.clone(),
            teardown_failing,
            last_provision: state.last_provision.clone(),
            last_teardown: state.last_teardown.clone(),
        }
    }
}
