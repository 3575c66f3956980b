//! Out-of-band management actions
//!
//! This module provides:
//! - The `ManagementAction` node spec for administrative calls against a
//!   running cluster that cannot be expressed as a resource declaration
//! - Idempotency key derivation (content hash or wall-clock)
//! - A keyed idempotency ledger with atomic check-reserve-commit per key
//! - The invoker that retries transient failures with bounded backoff

mod invoker;
mod ledger;

pub use invoker::{ActionInvoker, InvokerConfig, RemoteActionClient, RetryPolicy};
pub use ledger::{IdempotencyLedger, KeyReservation, LedgerError, LedgerRecord};

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::NodeId;

/// How idempotency keys are derived for management actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyKeyStrategy {
    /// Current time in milliseconds. Every attempt gets a fresh key, so
    /// retries of the same logical action are not deduplicated.
    TimeBased,
    /// Stable hash of the action's identity and parameters
    #[default]
    ContentHash,
}

impl IdempotencyKeyStrategy {
    pub fn derive(&self, node: &NodeId, service: &str, api: &str, parameters: &Value) -> String {
        match self {
            IdempotencyKeyStrategy::TimeBased => {
                format!("{}-{}", node, Utc::now().timestamp_millis())
            }
            IdempotencyKeyStrategy::ContentHash => {
                let mut hasher = Sha256::new();
                hasher.update(node.as_str().as_bytes());
                hasher.update([0u8]);
                hasher.update(parameters_hash(service, api, parameters).as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// SHA-256 over the call signature and canonical JSON parameters
pub fn parameters_hash(service: &str, api: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update([0u8]);
    hasher.update(api.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(parameters).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serializes with object keys sorted at every level, independent of how
/// `serde_json` was built.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let entries: BTreeMap<&String, String> = map
                .iter()
                .map(|(key, value)| (key, canonical_json(value)))
                .collect();
            let body: Vec<String> = entries
                .into_iter()
                .map(|(key, value)| format!("{}:{}", Value::String(key.clone()), value))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Dotted path restricting how much of a response is retained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSelector(String);

impl OutputSelector {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.split('.').all(|segment| !segment.is_empty())
    }

    /// Returns the value at the path, or `None` when any segment is missing.
    /// Numeric segments index into arrays.
    pub fn select(&self, response: &Value) -> Option<Value> {
        let mut current = response;
        for segment in self.0.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Role of an action within the capacity migration sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum ActionRole {
    #[default]
    Generic,
    /// Registers the secondary capacity pool against the cluster
    EnableCapacityPool { cluster: NodeId, service: NodeId },
    /// Points the running service's capacity strategy at the secondary pool
    RepointServiceToPool {
        service: NodeId,
        enable_action: NodeId,
    },
}

/// An administrative call applied exactly-effectively-once per idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementAction {
    /// Target service of the call, e.g. `ECS`
    pub service: String,
    /// API operation, e.g. `updateService`
    pub api: String,
    pub parameters: Value,
    pub idempotency_key: String,
    pub output_selector: Option<OutputSelector>,
    #[serde(default)]
    pub role: ActionRole,
}

impl ManagementAction {
    pub fn new(
        node: &NodeId,
        service: impl Into<String>,
        api: impl Into<String>,
        parameters: Value,
        strategy: IdempotencyKeyStrategy,
    ) -> Self {
        let service = service.into();
        let api = api.into();
        let idempotency_key = strategy.derive(node, &service, &api, &parameters);
        Self {
            service,
            api,
            parameters,
            idempotency_key,
            output_selector: None,
            role: ActionRole::Generic,
        }
    }

    pub fn with_output_selector(mut self, path: impl Into<String>) -> Self {
        self.output_selector = Some(OutputSelector::new(path));
        self
    }

    pub fn with_role(mut self, role: ActionRole) -> Self {
        self.role = role;
        self
    }

    /// Call signature as `service:api`
    pub fn signature(&self) -> String {
        format!("{}:{}", self.service, self.api)
    }

    pub fn parameters_hash(&self) -> String {
        parameters_hash(&self.service, &self.api, &self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_key_is_stable() {
        let node = NodeId::from("repoint-service");
        let params = json!({"cluster": "FargateCluster", "forceNewDeployment": true});

        let a = ManagementAction::new(
            &node,
            "ECS",
            "updateService",
            params.clone(),
            IdempotencyKeyStrategy::ContentHash,
        );
        let b = ManagementAction::new(
            &node,
            "ECS",
            "updateService",
            params,
            IdempotencyKeyStrategy::ContentHash,
        );

        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.idempotency_key.len(), 64);
    }

    #[test]
    fn test_content_hash_key_changes_with_parameters() {
        let node = NodeId::from("repoint-service");
        let strategy = IdempotencyKeyStrategy::ContentHash;

        let a = strategy.derive(&node, "ECS", "updateService", &json!({"desiredCount": 1}));
        let b = strategy.derive(&node, "ECS", "updateService", &json!({"desiredCount": 2}));

        assert_ne!(a, b);
    }

    #[test]
    fn test_parameter_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();

        assert_eq!(
            parameters_hash("ECS", "updateService", &a),
            parameters_hash("ECS", "updateService", &b)
        );
    }

    #[test]
    fn test_time_based_key_is_prefixed_by_node() {
        let key = IdempotencyKeyStrategy::TimeBased.derive(
            &NodeId::from("enable-pool"),
            "ECS",
            "putClusterCapacityProviders",
            &json!({}),
        );
        assert!(key.starts_with("enable-pool-"));
    }

    #[test]
    fn test_output_selector() {
        let response = json!({
            "service": {
                "serviceArn": "arn:aws:ecs:us-east-1:123:service/FargateCluster/api",
                "deployments": [{"id": "ecs-svc/1"}]
            }
        });

        let arn = OutputSelector::new("service.serviceArn").select(&response);
        assert_eq!(
            arn,
            Some(json!("arn:aws:ecs:us-east-1:123:service/FargateCluster/api"))
        );

        let deployment = OutputSelector::new("service.deployments.0.id").select(&response);
        assert_eq!(deployment, Some(json!("ecs-svc/1")));

        assert_eq!(OutputSelector::new("service.missing").select(&response), None);
    }

    #[test]
    fn test_output_selector_validity() {
        assert!(OutputSelector::new("service.serviceArn").is_valid());
        assert!(!OutputSelector::new("").is_valid());
        assert!(!OutputSelector::new("service..arn").is_valid());
    }
}
