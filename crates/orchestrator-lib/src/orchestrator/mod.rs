//! Staged provisioning and teardown
//!
//! Runs an [`ExecutionPlan`] stage by stage. Nodes within a stage are applied
//! concurrently, one task per node, bounded by a semaphore. The next stage
//! starts only after every task of the current stage has been joined. When a
//! node fails, its in-flight siblings finish but no further stage starts, and
//! the caller receives a report naming applied, failed and skipped nodes.

mod report;


pub use report::{ApplyReport, NodeOutcome, NodeReport, Operation};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::action::ActionInvoker;
use crate::capacity;
use crate::engine::ResourceEngine;
use crate::error::{FailureKind, ProvisionError, Result};
use crate::graph::ExecutionPlan;
use crate::guard::LifetimeGuard;
use crate::models::{NodeId, NodeSpec, ResourceNode};
use crate::observability::{OrchestratorMetrics, StructuredLogger};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on nodes applied at the same time
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

/// Failure of a single node
#[derive(Debug, Clone)]
struct NodeFailure {
    kind: FailureKind,
    reason: String,
}

type NodeResult = std::result::Result<Option<Value>, NodeFailure>;

/// Everything a node task needs, cheap to clone into each task
#[derive(Clone)]
struct NodeWorker {
    engine: Arc<dyn ResourceEngine>,
    invoker: Arc<ActionInvoker>,
    guard: Option<Arc<LifetimeGuard>>,
}

impl NodeWorker {
    async fn run(&self, operation: Operation, node: &ResourceNode) -> NodeResult {
        match operation {
            Operation::Provision => self.apply(node).await,
            Operation::Teardown => self.remove(node).await.map(|_| None),
        }
    }

    async fn apply(&self, node: &ResourceNode) -> NodeResult {
        match &node.spec {
            NodeSpec::ManagementAction(action) => self
                .invoker
                .apply(action)
                .await
                .map(Some)
                .map_err(|e| NodeFailure {
                    kind: e.kind(),
                    reason: e.to_string(),
                }),
            NodeSpec::LifetimeGuard(_) => {
                let output = self.engine.apply(node).await.map_err(engine_failure)?;
                if let Some(guard) = &self.guard {
                    guard.mark_installed(Utc::now()).await;
                }
                Ok(output)
            }
            _ => self.engine.apply(node).await.map_err(engine_failure),
        }
    }

    async fn remove(&self, node: &ResourceNode) -> std::result::Result<(), NodeFailure> {
        match &node.spec {
            // An applied call leaves nothing of its own to delete; its effect
            // goes away with the cluster and service it changed.
            NodeSpec::ManagementAction(_) => Ok(()),
            _ => self.engine.remove(node).await.map_err(engine_failure),
        }
    }
}

fn engine_failure(err: crate::error::EngineError) -> NodeFailure {
    NodeFailure {
        kind: FailureKind::Permanent,
        reason: err.to_string(),
    }
}

pub struct Orchestrator {
    worker: NodeWorker,
    config: OrchestratorConfig,
    metrics: OrchestratorMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ResourceEngine>,
        invoker: Arc<ActionInvoker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            worker: NodeWorker {
                engine,
                invoker,
                guard: None,
            },
            config,
            metrics: OrchestratorMetrics::new(),
            logger: StructuredLogger::new("default"),
        }
    }

    /// Attach the lifetime guard that is marked installed when its node applies
    pub fn with_guard(mut self, guard: Arc<LifetimeGuard>) -> Self {
        self.worker.guard = Some(guard);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn guard(&self) -> Option<&Arc<LifetimeGuard>> {
        self.worker.guard.as_ref()
    }

    /// Declare every node, then apply the plan stage by stage.
    ///
    /// Returns the full report on success and `PartialApplication` carrying
    /// it when any node failed.
    pub async fn provision(&self, plan: &ExecutionPlan) -> Result<ApplyReport> {
        let started_at = Utc::now();

        for node in plan.nodes() {
            self.worker.engine.declare(node).await?;
        }
        self.logger
            .log_deployment_started(env!("CARGO_PKG_VERSION"), plan.len(), plan.stages().len());

        let stages: Vec<Vec<Arc<ResourceNode>>> = plan
            .stages()
            .iter()
            .map(|stage| stage.iter().filter_map(|id| plan.node(id).cloned()).collect())
            .collect();

        let report = self.run(Operation::Provision, stages, started_at).await;

        let degraded = capacity::migration_degraded(plan, &report);
        if !degraded.is_empty() {
            self.logger.log_capacity_migration_degraded(&degraded);
        }
        self.finish(report)
    }

    /// Remove every node in the exact reverse of the application order
    pub async fn teardown(&self, plan: &ExecutionPlan) -> Result<ApplyReport> {
        let all: HashSet<NodeId> = plan.nodes().iter().map(|n| n.id.clone()).collect();
        self.teardown_subset(plan, &all).await
    }

    /// Remove exactly the nodes a partial report lists as applied
    pub async fn teardown_completed(
        &self,
        plan: &ExecutionPlan,
        report: &ApplyReport,
    ) -> Result<ApplyReport> {
        let applied: HashSet<NodeId> = report.applied().into_iter().collect();
        self.teardown_subset(plan, &applied).await
    }

    /// Remove the given nodes, dependents before their dependencies
    pub async fn teardown_subset(
        &self,
        plan: &ExecutionPlan,
        subset: &HashSet<NodeId>,
    ) -> Result<ApplyReport> {
        let started_at = Utc::now();
        let stages: Vec<Vec<Arc<ResourceNode>>> = plan
            .stages()
            .iter()
            .rev()
            .map(|stage| {
                stage
                    .iter()
                    .rev()
                    .filter(|id| subset.contains(*id))
                    .filter_map(|id| plan.node(id).cloned())
                    .collect::<Vec<_>>()
            })
            .filter(|stage| !stage.is_empty())
            .collect();

        debug!(nodes = subset.len(), stages = stages.len(), "Starting teardown");
        let report = self.run(Operation::Teardown, stages, started_at).await;
        self.finish(report)
    }

    fn finish(&self, report: ApplyReport) -> Result<ApplyReport> {
        self.metrics.record_report(&report);
        if report.is_complete() {
            info!(
                operation = %report.operation,
                nodes = report.nodes.len(),
                "Run completed"
            );
            Ok(report)
        } else {
            self.logger.log_partial_application(&report);
            Err(ProvisionError::PartialApplication {
                report: Box::new(report),
            })
        }
    }

    async fn run(
        &self,
        operation: Operation,
        stages: Vec<Vec<Arc<ResourceNode>>>,
        started_at: chrono::DateTime<Utc>,
    ) -> ApplyReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut nodes = Vec::new();
        let mut halted = false;

        for (index, stage) in stages.into_iter().enumerate() {
            if halted {
                for node in stage {
                    self.logger.log_node_skipped(operation, &node.id);
                    nodes.push(NodeReport {
                        id: node.id.clone(),
                        kind: node.kind(),
                        outcome: NodeOutcome::Skipped,
                        output: None,
                    });
                }
                continue;
            }

            debug!(operation = %operation, stage = index, nodes = stage.len(), "Starting stage");
            let results = self.run_stage(operation, &stage, &semaphore).await;

            for (node, (result, elapsed_secs)) in stage.iter().zip(results) {
                let report = match result {
                    Ok(output) => {
                        self.metrics
                            .observe_node_latency(operation, node.kind(), elapsed_secs);
                        self.logger.log_node_applied(
                            operation,
                            &node.id,
                            node.kind(),
                            (elapsed_secs * 1000.0) as u64,
                        );
                        NodeReport {
                            id: node.id.clone(),
                            kind: node.kind(),
                            outcome: NodeOutcome::Applied,
                            output,
                        }
                    }
                    Err(failure) => {
                        halted = true;
                        self.logger
                            .log_node_failed(operation, &node.id, node.kind(), &failure.reason);
                        NodeReport {
                            id: node.id.clone(),
                            kind: node.kind(),
                            outcome: NodeOutcome::Failed {
                                kind: failure.kind,
                                reason: failure.reason,
                            },
                            output: None,
                        }
                    }
                };
                nodes.push(report);
            }
        }

        ApplyReport {
            operation,
            started_at,
            finished_at: Utc::now(),
            nodes,
        }
    }

    /// Run one stage to completion; results are returned in stage order
    async fn run_stage(
        &self,
        operation: Operation,
        stage: &[Arc<ResourceNode>],
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(NodeResult, f64)> {
        let mut tasks = JoinSet::new();
        for (slot, node) in stage.iter().enumerate() {
            let worker = self.worker.clone();
            let semaphore = Arc::clone(semaphore);
            let node = Arc::clone(node);
            tasks.spawn(async move {
                // The semaphore is never closed, so a permit always arrives
                let _permit = semaphore.acquire_owned().await.ok();
                let started = Instant::now();
                let result = worker.run(operation, &node).await;
                (slot, result, started.elapsed().as_secs_f64())
            });
        }

        let mut results: Vec<Option<(NodeResult, f64)>> = vec![None; stage.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result, elapsed)) => results[slot] = Some((result, elapsed)),
                Err(e) => warn!(error = %e, "Node task ended abnormally"),
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    (
                        Err(NodeFailure {
                            kind: FailureKind::Permanent,
                            reason: "node task panicked before reporting".to_string(),
                        }),
                        0.0,
                    )
                })
            })
            .collect()
    }
}
