//! Per-node outcome reports for provisioning and teardown runs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;
use crate::models::{NodeId, ResourceKind};

/// Direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Provision,
    Teardown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Provision => write!(f, "provision"),
            Operation::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum NodeOutcome {
    Applied,
    Failed { kind: FailureKind, reason: String },
    /// Not attempted because an earlier stage failed
    Skipped,
}

impl NodeOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            NodeOutcome::Applied => "applied",
            NodeOutcome::Failed { .. } => "failed",
            NodeOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub kind: ResourceKind,
    pub outcome: NodeOutcome,
    /// Outputs returned when the node was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Outcome of every node in a run, in the order the run visited them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

impl ApplyReport {
    pub fn outcome(&self, id: &NodeId) -> Option<&NodeOutcome> {
        self.find(id).map(|n| &n.outcome)
    }

    pub fn output(&self, id: &NodeId) -> Option<&Value> {
        self.find(id).and_then(|n| n.output.as_ref())
    }

    fn find(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    fn ids_where(&self, status: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.outcome.status() == status)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn applied(&self) -> Vec<NodeId> {
        self.ids_where("applied")
    }

    pub fn failed(&self) -> Vec<NodeId> {
        self.ids_where("failed")
    }

    pub fn skipped(&self) -> Vec<NodeId> {
        self.ids_where("skipped")
    }

    /// True when every node was applied
    pub fn is_complete(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| matches!(n.outcome, NodeOutcome::Applied))
    }

    pub fn summary(&self) -> String {
        format!(
            "{} applied, {} failed, {} skipped",
            self.applied().len(),
            self.failed().len(),
            self.skipped().len()
        )
    }
}
