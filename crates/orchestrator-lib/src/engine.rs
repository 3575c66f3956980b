//! Resource engine seam
//!
//! The engine turns node declarations into provider API calls. It is an
//! external collaborator; the orchestrator only decides when each node is
//! declared, applied and removed.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::action::{ManagementAction, RemoteActionClient};
use crate::error::{ActionError, EngineError};
use crate::models::{NodeSpec, ResourceNode};

/// Declarative resource engine
#[async_trait]
pub trait ResourceEngine: Send + Sync {
    /// Register a node before any node is applied
    async fn declare(&self, node: &ResourceNode) -> Result<(), EngineError>;

    /// Create or update a node, returning any outputs it exposes
    async fn apply(&self, node: &ResourceNode) -> Result<Option<Value>, EngineError>;

    /// Remove a node
    async fn remove(&self, node: &ResourceNode) -> Result<(), EngineError>;
}

/// Engine that logs every call and always succeeds
#[derive(Debug, Default, Clone)]
pub struct DryRunEngine;

impl DryRunEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResourceEngine for DryRunEngine {
    async fn declare(&self, node: &ResourceNode) -> Result<(), EngineError> {
        info!(
            node = %node.id,
            kind = %node.kind(),
            depends_on = ?node.depends_on,
            "dry-run declare"
        );
        Ok(())
    }

    async fn apply(&self, node: &ResourceNode) -> Result<Option<Value>, EngineError> {
        info!(node = %node.id, kind = %node.kind(), "dry-run apply");
        let output = match &node.spec {
            NodeSpec::Service(service) => {
                let mut output = json!({
                    "load_balancer_dns": format!(
                        "{}-dry-run.elb.amazonaws.com",
                        service.service_name.to_lowercase()
                    ),
                });
                if let Some(domain) = &service.domain {
                    output["service_url"] = json!(format!("https://{}", domain.fqdn()));
                }
                Some(output)
            }
            NodeSpec::Cluster(cluster) => Some(json!({ "cluster_name": cluster.cluster_name })),
            _ => None,
        };
        Ok(output)
    }

    async fn remove(&self, node: &ResourceNode) -> Result<(), EngineError> {
        info!(node = %node.id, kind = %node.kind(), "dry-run remove");
        Ok(())
    }
}

/// Action client that logs every call and answers with a plausible response
#[derive(Debug, Default, Clone)]
pub struct DryRunActionClient;

impl DryRunActionClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteActionClient for DryRunActionClient {
    async fn invoke(&self, action: &ManagementAction) -> Result<Value, ActionError> {
        info!(
            call = %action.signature(),
            key = %action.idempotency_key,
            "dry-run management action"
        );
        let params = &action.parameters;
        let name = |field: &str| params[field].as_str().unwrap_or("unknown").to_string();
        let response = match action.api.as_str() {
            "putClusterCapacityProviders" => json!({
                "cluster": {
                    "clusterArn": format!("arn:aws:ecs:dry-run:cluster/{}", name("cluster")),
                    "capacityProviders": params["capacityProviders"],
                    "status": "ACTIVE",
                }
            }),
            "updateService" => json!({
                "service": {
                    "serviceArn": format!("arn:aws:ecs:dry-run:service/{}", name("service")),
                    "capacityProviderStrategy": params["capacityProviderStrategy"],
                    "deployments": [{ "status": "PRIMARY", "rolloutState": "IN_PROGRESS" }],
                }
            }),
            _ => json!({ "accepted": true }),
        };
        Ok(response)
    }
}
