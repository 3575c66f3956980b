//! Resource graph construction
//!
//! Nodes and dependency edges are declared here and validated once, centrally,
//! by the resolver. Construction order never implies application order.

mod resolver;

pub use resolver::{ExecutionPlan, ResolutionContext};
pub(crate) use resolver::require_direct;

use std::collections::HashMap;

use crate::error::{ProvisionError, Result};
use crate::models::{NodeId, ResourceNode};

/// Declared nodes in declaration order
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, usize>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Its dependencies need not be declared yet.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<NodeId> {
        if self.index.contains_key(&node.id) {
            return Err(ProvisionError::DuplicateNode { node: node.id });
        }
        let id = node.id.clone();
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(id)
    }

    /// Declare that `node` must be applied after `dependency`
    pub fn add_dependency(&mut self, node: &NodeId, dependency: &NodeId) -> Result<()> {
        let idx = *self.index.get(node).ok_or_else(|| {
            ProvisionError::unresolved(node, dependency, "node is not declared in graph")
        })?;
        self.nodes[idx].add_dependency(dependency.clone());
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate the whole graph and freeze it into an execution plan.
    ///
    /// Fails fast: no plan exists for a graph with a cycle, an undeclared
    /// dependency or an invalid node, so nothing can be applied partially.
    pub fn validate(self) -> Result<ExecutionPlan> {
        resolver::resolve(self.nodes)
    }
}
