//! Error types for the provisioning orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::NodeId;
use crate::orchestrator::ApplyReport;

/// The result type used throughout the orchestrator.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Whether a failure may succeed if retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors surfaced by graph validation, provisioning and teardown.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The dependency relation contains a cycle. Raised before any remote call.
    #[error("cycle detected in dependency graph: {nodes:?}")]
    CycleDetected {
        /// Nodes participating in the cycle, in declaration order.
        nodes: Vec<NodeId>,
    },

    /// A node refers to something that does not exist or is not yet resolvable.
    #[error("node {node} has unresolved dependency on {dependency}: {reason}")]
    UnresolvedDependency {
        node: NodeId,
        dependency: String,
        reason: String,
    },

    /// Two nodes were declared with the same id.
    #[error("duplicate node id: {node}")]
    DuplicateNode { node: NodeId },

    /// A node or the deployment configuration failed validation.
    #[error("invalid configuration for {node}: {reason}")]
    InvalidConfig { node: String, reason: String },

    /// A management action failed remotely.
    #[error("action {node} failed ({kind}): {reason}")]
    ActionFailed {
        node: NodeId,
        kind: FailureKind,
        reason: String,
    },

    /// The resource engine rejected a declaration.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Some nodes were applied before a later node failed permanently.
    #[error("partial {}: {}", .report.operation, .report.summary())]
    PartialApplication { report: Box<ApplyReport> },

    /// Lifetime guard expiry could not remove every node.
    #[error("teardown incomplete, nodes still present: {failed:?}")]
    GuardTeardownIncomplete { failed: Vec<NodeId> },
}

impl ProvisionError {
    pub fn unresolved(
        node: &NodeId,
        dependency: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnresolvedDependency {
            node: node.clone(),
            dependency: dependency.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid(node: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the per-node report carried by a partial application, if any.
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            Self::PartialApplication { report } => Some(report),
            _ => None,
        }
    }
}

/// Class of a retryable remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientClass {
    Throttling,
    Timeout,
    Unavailable,
}

/// Class of a remote failure that retrying cannot fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentClass {
    Validation,
    AccessDenied,
    NotFound,
    Conflict,
    ResponseTooLarge,
    /// Applied remotely, but the ledger could not make the record durable
    LedgerUnavailable,
}

impl fmt::Display for TransientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientClass::Throttling => write!(f, "throttling"),
            TransientClass::Timeout => write!(f, "timeout"),
            TransientClass::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl fmt::Display for PermanentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermanentClass::Validation => write!(f, "validation"),
            PermanentClass::AccessDenied => write!(f, "access denied"),
            PermanentClass::NotFound => write!(f, "not found"),
            PermanentClass::Conflict => write!(f, "conflict"),
            PermanentClass::ResponseTooLarge => write!(f, "response too large"),
            PermanentClass::LedgerUnavailable => write!(f, "ledger unavailable"),
        }
    }
}

/// Outcome of a failed management action call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("transient failure ({class}): {reason}")]
    Transient { class: TransientClass, reason: String },

    #[error("permanent failure ({class}): {reason}")]
    Permanent { class: PermanentClass, reason: String },
}

impl ActionError {
    pub fn transient(class: TransientClass, reason: impl Into<String>) -> Self {
        Self::Transient {
            class,
            reason: reason.into(),
        }
    }

    pub fn permanent(class: PermanentClass, reason: impl Into<String>) -> Self {
        Self::Permanent {
            class,
            reason: reason.into(),
        }
    }

    pub fn throttled(reason: impl Into<String>) -> Self {
        Self::transient(TransientClass::Throttling, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::transient(TransientClass::Timeout, reason)
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::permanent(PermanentClass::Validation, reason)
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::permanent(PermanentClass::AccessDenied, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::permanent(PermanentClass::NotFound, reason)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Transient { .. })
    }

    pub fn kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        }
    }
}

/// Failure reported by the external resource engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resource engine failed to {operation} {node}: {message}")]
pub struct EngineError {
    pub node: NodeId,
    pub operation: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(node: &NodeId, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            node: node.clone(),
            operation,
            message: message.into(),
        }
    }
}

/// A single field of a declared resource failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_classification() {
        assert!(ActionError::throttled("Rate exceeded").is_transient());
        assert!(ActionError::timeout("deadline").is_transient());
        assert!(!ActionError::access_denied("ecs:UpdateService").is_transient());
        assert_eq!(
            ActionError::not_found("service").kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_error_messages_name_the_node() {
        let err = ProvisionError::unresolved(
            &NodeId::from("loadtest-trigger"),
            "fargate-service",
            "not declared in graph",
        );
        let message = err.to_string();
        assert!(message.contains("loadtest-trigger"));
        assert!(message.contains("fargate-service"));

        let err = ProvisionError::CycleDetected {
            nodes: vec![NodeId::from("a"), NodeId::from("b")],
        };
        assert!(err.to_string().contains("\"a\""));
    }

    #[test]
    fn test_permanent_error_display_is_verbatim() {
        let err = ActionError::access_denied("not authorized to perform ecs:UpdateService");
        assert_eq!(
            err.to_string(),
            "permanent failure (access denied): not authorized to perform ecs:UpdateService"
        );
    }
}
