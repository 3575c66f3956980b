//! Core data models for declared infrastructure

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::ManagementAction;
use crate::guard::LifetimeGuardSpec;
use crate::scaling::ScalingPolicySpec;
use crate::trigger::ScheduledTriggerSpec;

/// Stable identity of a node, unique within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Closed set of resource kinds the orchestrator knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Cluster,
    Service,
    ScalingPolicy,
    ScheduledTrigger,
    ManagementAction,
    LifetimeGuard,
    NetworkRule,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Network => "network",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "service",
            ResourceKind::ScalingPolicy => "scaling_policy",
            ResourceKind::ScheduledTrigger => "scheduled_trigger",
            ResourceKind::ManagementAction => "management_action",
            ResourceKind::LifetimeGuard => "lifetime_guard",
            ResourceKind::NetworkRule => "network_rule",
        };
        f.write_str(name)
    }
}

/// Network shape: public subnets only, no NAT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub max_azs: u8,
    pub subnet_name: String,
    pub subnet_cidr_mask: u8,
    pub nat_gateways: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub container_insights: bool,
}

/// Public DNS name and certificate for the load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub site_domain: String,
    pub dns_name: String,
    /// Certificate validation is done through DNS records in the hosted zone
    pub dns_validated_certificate: bool,
}

impl DomainSpec {
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.dns_name, self.site_domain)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSpec {
    pub stream_prefix: String,
    pub retention_days: u32,
}

/// Private service discovery registration (`<name>.<namespace>`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySpec {
    pub namespace: String,
    pub name: String,
}

impl DiscoverySpec {
    pub fn hostname(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

/// Load-balanced container service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_name: String,
    pub container_image: String,
    pub container_port: u16,
    pub cpu_units: u32,
    pub memory_mib: u32,
    pub desired_count: u32,
    pub public_load_balancer: bool,
    pub assign_public_ip: bool,
    pub health_check_path: String,
    pub domain: Option<DomainSpec>,
    pub logging: LogSpec,
    pub discovery: Option<DiscoverySpec>,
}

impl ServiceSpec {
    /// Internal hostname, available only when the service registers for discovery
    pub fn discovery_hostname(&self) -> Option<String> {
        self.discovery.as_ref().map(DiscoverySpec::hostname)
    }
}

/// Where allowed traffic may originate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum RuleSource {
    /// Any address inside the deployment's network
    Network,
    Cidr(String),
}

/// Ingress rule governing traffic to the node it depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRuleSpec {
    pub governs: NodeId,
    pub port: u16,
    pub source: RuleSource,
    pub description: String,
}

/// Kind-specific attributes of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeSpec {
    Network(NetworkSpec),
    Cluster(ClusterSpec),
    Service(ServiceSpec),
    ScalingPolicy(ScalingPolicySpec),
    ScheduledTrigger(ScheduledTriggerSpec),
    ManagementAction(ManagementAction),
    LifetimeGuard(LifetimeGuardSpec),
    NetworkRule(NetworkRuleSpec),
}

impl NodeSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            NodeSpec::Network(_) => ResourceKind::Network,
            NodeSpec::Cluster(_) => ResourceKind::Cluster,
            NodeSpec::Service(_) => ResourceKind::Service,
            NodeSpec::ScalingPolicy(_) => ResourceKind::ScalingPolicy,
            NodeSpec::ScheduledTrigger(_) => ResourceKind::ScheduledTrigger,
            NodeSpec::ManagementAction(_) => ResourceKind::ManagementAction,
            NodeSpec::LifetimeGuard(_) => ResourceKind::LifetimeGuard,
            NodeSpec::NetworkRule(_) => ResourceKind::NetworkRule,
        }
    }
}

/// A declared unit of infrastructure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: NodeId,
    pub depends_on: Vec<NodeId>,
    pub spec: NodeSpec,
}

impl ResourceNode {
    pub fn new(id: impl Into<NodeId>, spec: NodeSpec) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            spec,
        }
    }

    /// Add a dependency; duplicates are ignored so the list behaves as a set
    pub fn depends_on(mut self, dependency: impl Into<NodeId>) -> Self {
        self.add_dependency(dependency.into());
        self
    }

    pub(crate) fn add_dependency(&mut self, dependency: NodeId) {
        if !self.depends_on.contains(&dependency) {
            self.depends_on.push(dependency);
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn has_dependency(&self, id: &NodeId) -> bool {
        self.depends_on.contains(id)
    }
}
