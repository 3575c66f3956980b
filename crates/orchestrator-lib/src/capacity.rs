//! Capacity migration sequencer
//!
//! Moves a running service onto a cheaper, preemptible capacity pool with two
//! management actions:
//!
//! 1. register the secondary pool against the cluster
//! 2. repoint the service's capacity strategy at that pool, forcing a new
//!    deployment so running tasks are replaced
//!
//! Both actions depend on the service, and the repoint depends on the enable
//! action. The edges are declared on the nodes themselves and checked by the
//! resolver, so no stage can ever hold both actions or run the repoint early.
//! A failed repoint leaves the service running on primary capacity; that is
//! reported, not rolled back.

use serde_json::json;

use crate::action::{ActionRole, IdempotencyKeyStrategy, ManagementAction};
use crate::error::{ProvisionError, Result};
use crate::graph::{ExecutionPlan, ResolutionContext, ResourceGraph};
use crate::models::{NodeId, NodeSpec, ResourceKind, ResourceNode};
use crate::orchestrator::{ApplyReport, NodeOutcome};

pub const PRIMARY_POOL: &str = "FARGATE";
pub const SPOT_POOL: &str = "FARGATE_SPOT";

/// Two-step migration of one service onto the spot pool
#[derive(Debug, Clone)]
pub struct CapacityMigration {
    pub cluster: NodeId,
    pub cluster_name: String,
    pub service: NodeId,
    pub service_name: String,
    pub enable_id: NodeId,
    pub repoint_id: NodeId,
    pub key_strategy: IdempotencyKeyStrategy,
}

impl CapacityMigration {
    pub fn new(
        cluster: (&NodeId, &str),
        service: (&NodeId, &str),
        key_strategy: IdempotencyKeyStrategy,
    ) -> Self {
        Self {
            cluster: cluster.0.clone(),
            cluster_name: cluster.1.to_string(),
            service: service.0.clone(),
            service_name: service.1.to_string(),
            enable_id: NodeId::from("enable-spot-capacity"),
            repoint_id: NodeId::from("repoint-service-to-spot"),
            key_strategy,
        }
    }

    pub fn with_ids(mut self, enable: impl Into<NodeId>, repoint: impl Into<NodeId>) -> Self {
        self.enable_id = enable.into();
        self.repoint_id = repoint.into();
        self
    }

    /// Register both pools with the cluster
    pub fn enable_action(&self) -> ManagementAction {
        let parameters = json!({
            "cluster": self.cluster_name,
            "capacityProviders": [PRIMARY_POOL, SPOT_POOL],
            "defaultCapacityProviderStrategy": [],
        });
        ManagementAction::new(
            &self.enable_id,
            "ECS",
            "putClusterCapacityProviders",
            parameters,
            self.key_strategy,
        )
        .with_output_selector("cluster.clusterArn")
        .with_role(ActionRole::EnableCapacityPool {
            cluster: self.cluster.clone(),
            service: self.service.clone(),
        })
    }

    /// Weight everything onto the spot pool and replace running tasks
    pub fn repoint_action(&self) -> ManagementAction {
        let parameters = json!({
            "cluster": self.cluster_name,
            "service": self.service_name,
            "capacityProviderStrategy": [
                { "capacityProvider": SPOT_POOL, "weight": 1 },
                { "capacityProvider": PRIMARY_POOL, "base": 0, "weight": 0 },
            ],
            "forceNewDeployment": true,
        });
        ManagementAction::new(
            &self.repoint_id,
            "ECS",
            "updateService",
            parameters,
            self.key_strategy,
        )
        .with_output_selector("service.serviceArn")
        .with_role(ActionRole::RepointServiceToPool {
            service: self.service.clone(),
            enable_action: self.enable_id.clone(),
        })
    }

    /// Both action nodes with their ordering edges declared
    pub fn nodes(&self) -> [ResourceNode; 2] {
        let enable = ResourceNode::new(
            self.enable_id.clone(),
            NodeSpec::ManagementAction(self.enable_action()),
        )
        .depends_on(self.cluster.clone())
        .depends_on(self.service.clone());

        let repoint = ResourceNode::new(
            self.repoint_id.clone(),
            NodeSpec::ManagementAction(self.repoint_action()),
        )
        .depends_on(self.enable_id.clone())
        .depends_on(self.service.clone());

        [enable, repoint]
    }

    /// Add both action nodes to `graph`
    pub fn install(&self, graph: &mut ResourceGraph) -> Result<()> {
        for node in self.nodes() {
            graph.add_node(node)?;
        }
        Ok(())
    }
}

/// Check the ordering edges of capacity migration actions
pub(crate) fn check_resolution(
    node: &ResourceNode,
    action: &ManagementAction,
    ctx: &ResolutionContext<'_>,
) -> Result<()> {
    use crate::graph::require_direct;

    match &action.role {
        ActionRole::Generic => Ok(()),
        ActionRole::EnableCapacityPool { cluster, service } => {
            require_direct(node, cluster, ResourceKind::Cluster, ctx)?;
            require_direct(node, service, ResourceKind::Service, ctx)
        }
        ActionRole::RepointServiceToPool {
            service,
            enable_action,
        } => {
            require_direct(node, service, ResourceKind::Service, ctx)?;
            require_direct(node, enable_action, ResourceKind::ManagementAction, ctx)?;

            let enables_same_service = ctx.node(enable_action).is_some_and(|n| {
                matches!(
                    &n.spec,
                    NodeSpec::ManagementAction(ManagementAction {
                        role: ActionRole::EnableCapacityPool { service: s, .. },
                        ..
                    }) if s == service
                )
            });
            if !enables_same_service {
                return Err(ProvisionError::unresolved(
                    &node.id,
                    enable_action,
                    format!("does not enable a capacity pool for service {}", service),
                ));
            }
            Ok(())
        }
    }
}

/// Capacity actions that did not apply while their service did.
///
/// A non-empty result means the service is still running on primary
/// capacity.
pub fn migration_degraded(plan: &ExecutionPlan, report: &ApplyReport) -> Vec<NodeId> {
    plan.nodes()
        .iter()
        .filter_map(|node| match &node.spec {
            NodeSpec::ManagementAction(action) => {
                let service = match &action.role {
                    ActionRole::EnableCapacityPool { service, .. }
                    | ActionRole::RepointServiceToPool { service, .. } => service,
                    ActionRole::Generic => return None,
                };
                let service_up = matches!(report.outcome(service), Some(NodeOutcome::Applied));
                let action_done = matches!(report.outcome(&node.id), Some(NodeOutcome::Applied));
                (service_up && !action_done).then(|| node.id.clone())
            }
            _ => None,
        })
        .collect()
}
