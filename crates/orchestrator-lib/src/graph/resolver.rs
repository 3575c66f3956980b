//! Dependency resolution
//!
//! Orders nodes so that every node follows all of its dependencies, using
//! Kahn's algorithm with ties broken by declaration order. Cycles are
//! reported with the ids of every node on them. Nodes are grouped into
//! stages: a node's stage is one past the deepest stage among its
//! dependencies, so nodes sharing a stage never depend on each other. The
//! application order lists stage 0 first, each stage in topological order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::capacity;
use crate::error::{ProvisionError, Result};
use crate::models::{NodeId, NodeSpec, ResourceKind, ResourceNode};
use crate::trigger;

/// Validated, immutable application order
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: Vec<Arc<ResourceNode>>,
    positions: HashMap<NodeId, usize>,
    stages: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    /// Nodes in application order
    pub fn nodes(&self) -> &[Arc<ResourceNode>] {
        &self.nodes
    }

    pub fn order(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Exact reverse of the application order
    pub fn teardown_order(&self) -> Vec<NodeId> {
        self.nodes.iter().rev().map(|n| n.id.clone()).collect()
    }

    pub fn stages(&self) -> &[Vec<NodeId>] {
        &self.stages
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<ResourceNode>> {
        self.positions.get(id).map(|&pos| &self.nodes[pos])
    }

    /// Position of a node in the application order
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Read-only view used by per-kind cross-node checks
pub struct ResolutionContext<'a> {
    nodes: &'a [ResourceNode],
    index: HashMap<&'a NodeId, usize>,
    ancestors: Vec<HashSet<usize>>,
}

impl<'a> ResolutionContext<'a> {
    pub fn node(&self, id: &NodeId) -> Option<&'a ResourceNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    /// True when `node` depends on `on` directly or transitively
    pub fn depends_on(&self, node: &NodeId, on: &NodeId) -> bool {
        match (self.index.get(node), self.index.get(on)) {
            (Some(&n), Some(&o)) => self.ancestors[n].contains(&o),
            _ => false,
        }
    }
}

pub(crate) fn resolve(nodes: Vec<ResourceNode>) -> Result<ExecutionPlan> {
    let index: HashMap<&NodeId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (&node.id, idx))
        .collect();

    // Every edge must point at a declared node
    for node in &nodes {
        for dep in &node.depends_on {
            if !index.contains_key(dep) {
                return Err(ProvisionError::unresolved(
                    &node.id,
                    dep,
                    "not declared in graph",
                ));
            }
        }
    }

    // Edges run dependency -> dependent; NodeIndex(i) is declaration index i
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len() * 2);
    for idx in 0..nodes.len() {
        graph.add_node(idx);
    }
    for (idx, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            graph.add_edge(NodeIndex::new(index[dep]), NodeIndex::new(idx), ());
        }
    }

    detect_cycles(&graph, &nodes)?;
    let order = topological_order(&graph);

    let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); nodes.len()];
    let mut stage_of: Vec<usize> = vec![0; nodes.len()];
    for &idx in &order {
        let mut set = HashSet::new();
        let mut stage = 0;
        for dep in graph.neighbors_directed(NodeIndex::new(idx), Direction::Incoming) {
            let dep = dep.index();
            set.insert(dep);
            set.extend(ancestors[dep].iter().copied());
            stage = stage.max(stage_of[dep] + 1);
        }
        ancestors[idx] = set;
        stage_of[idx] = stage;
    }

    let ctx = ResolutionContext {
        nodes: &nodes,
        index,
        ancestors,
    };
    for node in &nodes {
        check_node(node, &ctx)?;
    }
    check_guard_coverage(&nodes, &ctx)?;

    let stage_count = stage_of.iter().copied().max().map_or(0, |s| s + 1);
    let mut stages: Vec<Vec<NodeId>> = vec![Vec::new(); stage_count];
    for &idx in &order {
        stages[stage_of[idx]].push(nodes[idx].id.clone());
    }

    debug!(
        nodes = nodes.len(),
        stages = stages.len(),
        "Resolved dependency graph"
    );

    // Application order is stage by stage, so teardown can walk it backwards
    let mut stage_major: Vec<usize> = order.clone();
    stage_major.sort_by_key(|&idx| stage_of[idx]);

    let mut slots: Vec<Option<ResourceNode>> = nodes.into_iter().map(Some).collect();
    let ordered: Vec<Arc<ResourceNode>> = stage_major
        .iter()
        .filter_map(|&idx| slots[idx].take().map(Arc::new))
        .collect();
    let positions = ordered
        .iter()
        .enumerate()
        .map(|(pos, node)| (node.id.clone(), pos))
        .collect();

    Ok(ExecutionPlan {
        nodes: ordered,
        positions,
        stages,
    })
}

/// Report every strongly connected component that forms a cycle
fn detect_cycles(graph: &DiGraph<usize, ()>, nodes: &[ResourceNode]) -> Result<()> {
    let mut cyclic: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.find_edge(component[0], component[0]).is_some()
        })
        .flatten()
        .map(|idx| idx.index())
        .collect();

    if cyclic.is_empty() {
        return Ok(());
    }

    cyclic.sort_unstable();
    Err(ProvisionError::CycleDetected {
        nodes: cyclic.into_iter().map(|idx| nodes[idx].id.clone()).collect(),
    })
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first
fn topological_order(graph: &DiGraph<usize, ()>) -> Vec<usize> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for dependent in graph.neighbors_directed(NodeIndex::new(idx), Direction::Outgoing) {
            let deg = &mut in_degree[dependent.index()];
            *deg -= 1;
            if *deg == 0 {
                ready.push(Reverse(dependent.index()));
            }
        }
    }
    order
}

/// Kind-specific validation, including checks against other nodes
fn check_node(node: &ResourceNode, ctx: &ResolutionContext<'_>) -> Result<()> {
    match &node.spec {
        NodeSpec::ScalingPolicy(policy) => {
            policy
                .validate()
                .map_err(|e| ProvisionError::invalid(&node.id, e.to_string()))?;
            require_direct(node, &policy.target_service, ResourceKind::Service, ctx)
        }
        NodeSpec::ScheduledTrigger(spec) => {
            spec.validate()
                .map_err(|e| ProvisionError::invalid(&node.id, e.to_string()))?;
            trigger::check_resolution(node, spec, ctx)
        }
        NodeSpec::ManagementAction(action) => {
            if action.idempotency_key.is_empty() {
                return Err(ProvisionError::invalid(&node.id, "idempotency key is empty"));
            }
            if let Some(selector) = &action.output_selector {
                if !selector.is_valid() {
                    return Err(ProvisionError::invalid(
                        &node.id,
                        format!("output selector {:?} is not a valid path", selector.path()),
                    ));
                }
            }
            capacity::check_resolution(node, action, ctx)
        }
        NodeSpec::LifetimeGuard(spec) => spec
            .validate()
            .map_err(|e| ProvisionError::invalid(&node.id, e.to_string())),
        NodeSpec::NetworkRule(rule) => {
            if ctx.node(&rule.governs).is_none() {
                return Err(ProvisionError::unresolved(
                    &node.id,
                    &rule.governs,
                    "governed node is not declared in graph",
                ));
            }
            if !node.has_dependency(&rule.governs) {
                return Err(ProvisionError::unresolved(
                    &node.id,
                    &rule.governs,
                    "rule must depend on the node whose traffic it governs",
                ));
            }
            Ok(())
        }
        NodeSpec::Service(service) => {
            if service.container_port == 0 || service.cpu_units == 0 || service.memory_mib == 0 {
                return Err(ProvisionError::invalid(
                    &node.id,
                    "container port, cpu units and memory must be non-zero",
                ));
            }
            Ok(())
        }
        NodeSpec::Network(_) | NodeSpec::Cluster(_) => Ok(()),
    }
}

/// `node` must directly depend on `target`, which must be of kind `kind`
pub(crate) fn require_direct(
    node: &ResourceNode,
    target: &NodeId,
    kind: ResourceKind,
    ctx: &ResolutionContext<'_>,
) -> Result<()> {
    match ctx.node(target) {
        None => Err(ProvisionError::unresolved(
            &node.id,
            target,
            format!("{} is not declared in graph", kind),
        )),
        Some(found) if found.kind() != kind => Err(ProvisionError::unresolved(
            &node.id,
            target,
            format!("expected a {} node, found {}", kind, found.kind()),
        )),
        Some(_) if !node.has_dependency(target) => Err(ProvisionError::unresolved(
            &node.id,
            target,
            format!("must declare a dependency on {} {}", kind, target),
        )),
        Some(_) => Ok(()),
    }
}

/// With a lifetime guard present, every other node must sit beneath it
fn check_guard_coverage(nodes: &[ResourceNode], ctx: &ResolutionContext<'_>) -> Result<()> {
    let guards: Vec<&ResourceNode> = nodes
        .iter()
        .filter(|n| n.kind() == ResourceKind::LifetimeGuard)
        .collect();

    let guard = match guards.as_slice() {
        [] => return Ok(()),
        [guard] => *guard,
        _ => {
            return Err(ProvisionError::invalid(
                &guards[1].id,
                "only one lifetime guard may be declared",
            ))
        }
    };

    if !guard.depends_on.is_empty() {
        return Err(ProvisionError::invalid(
            &guard.id,
            "the lifetime guard must not depend on other nodes",
        ));
    }

    for node in nodes.iter().filter(|n| n.id != guard.id) {
        if !ctx.depends_on(&node.id, &guard.id) {
            return Err(ProvisionError::unresolved(
                &node.id,
                &guard.id,
                "not covered by the lifetime guard",
            ));
        }
    }
    Ok(())
}
