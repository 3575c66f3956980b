//! Observability infrastructure for the orchestrator
//!
//! Provides:
//! - Prometheus metrics (node apply latency, outcomes, retries, ledger replays, guard state)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

use crate::guard::GuardState;
use crate::models::{NodeId, ResourceKind};
use crate::orchestrator::{ApplyReport, Operation};

/// Default histogram buckets for remote call latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<OrchestratorMetricsInner> = OnceLock::new();

struct OrchestratorMetricsInner {
    node_apply_seconds: HistogramVec,
    action_call_seconds: Histogram,
    node_outcomes: IntCounterVec,
    action_retries: IntCounter,
    ledger_replays: IntCounter,
    guard_state: IntGauge,
    teardown_attempts: IntCounter,
}

impl OrchestratorMetricsInner {
    fn new() -> Self {
        Self {
            node_apply_seconds: register_histogram_vec!(
                "orchestrator_node_apply_seconds",
                "Time spent applying or removing a single node",
                &["operation", "kind"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register node_apply_seconds"),

            action_call_seconds: register_histogram!(
                "orchestrator_action_call_seconds",
                "Latency of individual management action calls",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register action_call_seconds"),

            node_outcomes: register_int_counter_vec!(
                "orchestrator_node_outcomes_total",
                "Node outcomes by operation and status",
                &["operation", "status"]
            )
            .expect("Failed to register node_outcomes"),

            action_retries: register_int_counter!(
                "orchestrator_action_retries_total",
                "Management action calls retried after a transient failure"
            )
            .expect("Failed to register action_retries"),

            ledger_replays: register_int_counter!(
                "orchestrator_ledger_replays_total",
                "Management actions answered from the idempotency ledger"
            )
            .expect("Failed to register ledger_replays"),

            guard_state: register_int_gauge!(
                "orchestrator_guard_state",
                "Lifetime guard state (0 installing, 1 active, 2 expiring, 3 torn down)"
            )
            .expect("Failed to register guard_state"),

            teardown_attempts: register_int_counter!(
                "orchestrator_teardown_attempts_total",
                "Teardown attempts started by the lifetime guard"
            )
            .expect("Failed to register teardown_attempts"),
        }
    }
}

/// Orchestrator metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    _private: (),
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OrchestratorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OrchestratorMetricsInner {
        GLOBAL_METRICS.get_or_init(OrchestratorMetricsInner::new)
    }

    pub fn observe_node_latency(&self, operation: Operation, kind: ResourceKind, secs: f64) {
        self.inner()
            .node_apply_seconds
            .with_label_values(&[&operation.to_string(), &kind.to_string()])
            .observe(secs);
    }

    pub fn observe_action_latency(&self, secs: f64) {
        self.inner().action_call_seconds.observe(secs);
    }

    /// Count every node outcome of a finished run
    pub fn record_report(&self, report: &ApplyReport) {
        let operation = report.operation.to_string();
        for node in &report.nodes {
            self.inner()
                .node_outcomes
                .with_label_values(&[&operation, node.outcome.status()])
                .inc();
        }
    }

    pub fn inc_action_retries(&self) {
        self.inner().action_retries.inc();
    }

    pub fn inc_ledger_replays(&self) {
        self.inner().ledger_replays.inc();
    }

    pub fn set_guard_state(&self, state: GuardState) {
        let value = match state {
            GuardState::Installing => 0,
            GuardState::Active => 1,
            GuardState::Expiring => 2,
            GuardState::TornDown => 3,
        };
        self.inner().guard_state.set(value);
    }

    pub fn inc_teardown_attempts(&self) {
        self.inner().teardown_attempts.inc();
    }
}

/// Structured logger for deployment events
///
/// Provides consistent JSON-formatted logging for node outcomes,
/// guard transitions and teardown problems.
#[derive(Clone)]
pub struct StructuredLogger {
    stack: String,
}

impl StructuredLogger {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn log_deployment_started(&self, version: &str, nodes: usize, stages: usize) {
        info!(
            event = "deployment_started",
            stack = %self.stack,
            version = %version,
            nodes = nodes,
            stages = stages,
            "Provisioning deployment"
        );
    }

    pub fn log_node_applied(
        &self,
        operation: Operation,
        node: &NodeId,
        kind: ResourceKind,
        elapsed_ms: u64,
    ) {
        info!(
            event = "node_applied",
            stack = %self.stack,
            operation = %operation,
            node = %node,
            kind = %kind,
            elapsed_ms = elapsed_ms,
            "Node completed"
        );
    }

    pub fn log_node_failed(
        &self,
        operation: Operation,
        node: &NodeId,
        kind: ResourceKind,
        reason: &str,
    ) {
        warn!(
            event = "node_failed",
            stack = %self.stack,
            operation = %operation,
            node = %node,
            kind = %kind,
            reason = %reason,
            "Node failed"
        );
    }

    pub fn log_node_skipped(&self, operation: Operation, node: &NodeId) {
        info!(
            event = "node_skipped",
            stack = %self.stack,
            operation = %operation,
            node = %node,
            "Node not attempted after an earlier failure"
        );
    }

    /// Half-provisioned resources keep billing; always log at warn
    pub fn log_partial_application(&self, report: &ApplyReport) {
        warn!(
            event = "partial_application",
            stack = %self.stack,
            operation = %report.operation,
            applied = ?report.applied(),
            failed = ?report.failed(),
            skipped = ?report.skipped(),
            "Run stopped after a permanent failure"
        );
    }

    pub fn log_guard_transition(&self, from: GuardState, to: GuardState) {
        info!(
            event = "guard_transition",
            stack = %self.stack,
            from = %from,
            to = %to,
            "Lifetime guard state changed"
        );
    }

    pub fn log_teardown_incomplete(&self, failed: &[NodeId], attempt: u32) {
        error!(
            event = "teardown_incomplete",
            stack = %self.stack,
            failed = ?failed,
            attempt = attempt,
            "Lifetime guard could not remove every node, resources may still be billing"
        );
    }

    pub fn log_capacity_migration_degraded(&self, failed: &[NodeId]) {
        warn!(
            event = "capacity_migration_degraded",
            stack = %self.stack,
            failed = ?failed,
            "Service remains on primary capacity"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "driver_shutdown",
            stack = %self.stack,
            reason = %reason,
            "Deployment driver shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registration() {
        let a = OrchestratorMetrics::new();
        let b = OrchestratorMetrics::new();

        // Other tests share the global registry, so only check the deltas
        let retries = a.inner().action_retries.get();
        let replays = a.inner().ledger_replays.get();
        let attempts = a.inner().teardown_attempts.get();
        let latency = a
            .inner()
            .node_apply_seconds
            .with_label_values(&["provision", "service"])
            .get_sample_count();

        a.observe_node_latency(Operation::Provision, ResourceKind::Service, 1.5);
        b.observe_action_latency(0.2);
        a.inc_action_retries();
        b.inc_ledger_replays();
        b.inc_teardown_attempts();

        assert!(b.inner().action_retries.get() > retries);
        assert!(b.inner().ledger_replays.get() > replays);
        assert!(a.inner().teardown_attempts.get() > attempts);
        assert!(
            b.inner()
                .node_apply_seconds
                .with_label_values(&["provision", "service"])
                .get_sample_count()
                > latency
        );

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        for name in [
            "orchestrator_node_apply_seconds",
            "orchestrator_action_retries_total",
            "orchestrator_ledger_replays_total",
            "orchestrator_teardown_attempts_total",
        ] {
            assert!(names.iter().any(|n| n == name), "{name} not registered");
        }
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("AwsFargateClusterStack");
        assert_eq!(logger.stack(), "AwsFargateClusterStack");
    }
}
