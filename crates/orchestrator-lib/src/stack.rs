//! The load-test stack blueprint
//!
//! Builds the fixed provisioning shape: lifetime guard, network, cluster,
//! load-balanced service, then the scaling policy, ingress rule, scheduled
//! load trigger and capacity migration that all hang off the service.

use serde_json::Value;

use crate::capacity::CapacityMigration;
use crate::config::DeploymentConfig;
use crate::error::{ProvisionError, Result};
use crate::graph::ResourceGraph;
use crate::guard::LifetimeGuardSpec;
use crate::models::{
    ClusterSpec, DiscoverySpec, DomainSpec, LogSpec, NetworkRuleSpec, NetworkSpec, NodeId,
    NodeSpec, ResourceNode, RuleSource, ServiceSpec,
};
use crate::orchestrator::ApplyReport;
use crate::trigger::ScheduledTriggerSpec;

/// Node ids of the blueprint
pub mod ids {
    pub const LIFETIME_GUARD: &str = "lifetime-guard";
    pub const NETWORK: &str = "fargate-vpc";
    pub const CLUSTER: &str = "fargate-cluster";
    pub const SERVICE: &str = "fargate-service";
    pub const SCALING: &str = "cpu-scaling";
    pub const INGRESS: &str = "service-ingress";
    pub const TRIGGER: &str = "loadtest-trigger";
    pub const ENABLE_SPOT: &str = "enable-spot-capacity";
    pub const REPOINT_SPOT: &str = "repoint-service-to-spot";
}

const CLUSTER_NAME: &str = "FargateCluster";
const SERVICE_NAME: &str = "FargateService";
const DISCOVERY_NAME: &str = "loadtest-api";

/// Declare every node of the stack. The graph still has to be validated.
pub fn build_graph(config: &DeploymentConfig) -> Result<ResourceGraph> {
    config
        .validate()
        .map_err(|e| ProvisionError::invalid(&config.stack_name, e.to_string()))?;

    let mut graph = ResourceGraph::new();

    graph.add_node(ResourceNode::new(
        ids::LIFETIME_GUARD,
        NodeSpec::LifetimeGuard(LifetimeGuardSpec::new(config.ttl())),
    ))?;

    graph.add_node(
        ResourceNode::new(
            ids::NETWORK,
            NodeSpec::Network(NetworkSpec {
                max_azs: config.max_azs,
                subnet_name: "FargatePublicSubnet".to_string(),
                subnet_cidr_mask: config.subnet_cidr_mask,
                nat_gateways: 0,
            }),
        )
        .depends_on(ids::LIFETIME_GUARD),
    )?;

    graph.add_node(
        ResourceNode::new(
            ids::CLUSTER,
            NodeSpec::Cluster(ClusterSpec {
                cluster_name: CLUSTER_NAME.to_string(),
                container_insights: true,
            }),
        )
        .depends_on(ids::NETWORK),
    )?;

    let service = service_spec(config);
    let service_id = NodeId::from(ids::SERVICE);
    let trigger = ScheduledTriggerSpec::for_service(
        &service_id,
        &service,
        config.schedule(),
        Vec::new(),
        config.trigger_concurrency,
    )?;
    let trigger = ScheduledTriggerSpec {
        command: load_command(trigger.target_address.as_str()),
        ..trigger
    };

    graph.add_node(
        ResourceNode::new(ids::SERVICE, NodeSpec::Service(service)).depends_on(ids::CLUSTER),
    )?;

    graph.add_node(
        ResourceNode::new(
            ids::SCALING,
            NodeSpec::ScalingPolicy(config.scaling_policy(ids::SERVICE)),
        )
        .depends_on(ids::SERVICE),
    )?;

    graph.add_node(
        ResourceNode::new(
            ids::INGRESS,
            NodeSpec::NetworkRule(NetworkRuleSpec {
                governs: service_id.clone(),
                port: config.container_port,
                source: RuleSource::Network,
                description: "Load generator traffic from inside the VPC".to_string(),
            }),
        )
        .depends_on(ids::SERVICE),
    )?;

    graph.add_node(
        ResourceNode::new(ids::TRIGGER, NodeSpec::ScheduledTrigger(trigger))
            .depends_on(ids::SERVICE),
    )?;

    CapacityMigration::new(
        (&NodeId::from(ids::CLUSTER), CLUSTER_NAME),
        (&service_id, SERVICE_NAME),
        config.idempotency_key_strategy,
    )
    .with_ids(ids::ENABLE_SPOT, ids::REPOINT_SPOT)
    .install(&mut graph)?;

    Ok(graph)
}

fn service_spec(config: &DeploymentConfig) -> ServiceSpec {
    ServiceSpec {
        service_name: SERVICE_NAME.to_string(),
        container_image: config.container_image.clone(),
        container_port: config.container_port,
        cpu_units: config.cpu_units,
        memory_mib: config.memory_mib,
        desired_count: 1,
        public_load_balancer: true,
        assign_public_ip: true,
        health_check_path: config.health_check_path.clone(),
        domain: Some(DomainSpec {
            site_domain: config.site_domain.clone(),
            dns_name: config.dns_name.clone(),
            dns_validated_certificate: true,
        }),
        logging: LogSpec {
            stream_prefix: "FargateLoadtest".to_string(),
            retention_days: config.log_retention_days,
        },
        discovery: Some(DiscoverySpec {
            namespace: config.discovery_namespace.clone(),
            name: DISCOVERY_NAME.to_string(),
        }),
    }
}

fn load_command(address: &str) -> Vec<String> {
    ["hey", "-z", "50s", "-c", "20", address]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Public DNS name of the service's load balancer, once provisioned
pub fn load_balancer_dns(report: &ApplyReport) -> Option<String> {
    report
        .output(&NodeId::from(ids::SERVICE))
        .and_then(|output| output.get("load_balancer_dns"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKind;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_blueprint_resolves_in_expected_stages() {
        let plan = build_graph(&DeploymentConfig::default())
            .unwrap()
            .validate()
            .unwrap();

        let stages: Vec<Vec<&str>> = plan
            .stages()
            .iter()
            .map(|s| s.iter().map(NodeId::as_str).collect())
            .collect();
        assert_eq!(
            stages,
            vec![
                vec![ids::LIFETIME_GUARD],
                vec![ids::NETWORK],
                vec![ids::CLUSTER],
                vec![ids::SERVICE],
                vec![ids::SCALING, ids::INGRESS, ids::TRIGGER, ids::ENABLE_SPOT],
                vec![ids::REPOINT_SPOT],
            ]
        );
    }

    #[test]
    fn test_trigger_targets_discovery_name() {
        let graph = build_graph(&DeploymentConfig::default()).unwrap();
        let trigger = graph.get(&id(ids::TRIGGER)).unwrap();
        match &trigger.spec {
            NodeSpec::ScheduledTrigger(spec) => {
                assert_eq!(
                    spec.target_address.as_str(),
                    "http://loadtest-api.loadtest.local:8000/hello"
                );
                assert_eq!(spec.command.last().unwrap(), spec.target_address.as_str());
                assert_eq!(spec.schedule.expression(), "rate(1 minute)");
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_service_carries_original_attributes() {
        let graph = build_graph(&DeploymentConfig::default()).unwrap();
        match &graph.get(&id(ids::SERVICE)).unwrap().spec {
            NodeSpec::Service(service) => {
                assert_eq!(service.container_image, "jmb12686/go-loadtest-api");
                assert_eq!(service.cpu_units, 256);
                assert_eq!(service.memory_mib, 512);
                assert_eq!(
                    service.domain.as_ref().unwrap().fqdn(),
                    "fargate-loadtest.belisleonline.com"
                );
                assert_eq!(service.logging.retention_days, 60);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_removing_enable_edge_is_rejected() {
        let mut nodes: Vec<ResourceNode> = build_graph(&DeploymentConfig::default())
            .unwrap()
            .nodes()
            .to_vec();
        for node in nodes.iter_mut() {
            if node.id == id(ids::REPOINT_SPOT) {
                node.depends_on.retain(|d| d != &id(ids::ENABLE_SPOT));
            }
        }

        let mut graph = ResourceGraph::new();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        match graph.validate().unwrap_err() {
            ProvisionError::UnresolvedDependency {
                node, dependency, ..
            } => {
                assert_eq!(node, id(ids::REPOINT_SPOT));
                assert_eq!(dependency, ids::ENABLE_SPOT);
            }
            other => panic!("expected unresolved dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_node_outside_guard_is_rejected() {
        let mut graph = build_graph(&DeploymentConfig::default()).unwrap();
        graph
            .add_node(ResourceNode::new(
                "stray-cluster",
                NodeSpec::Cluster(ClusterSpec {
                    cluster_name: "Stray".to_string(),
                    container_insights: false,
                }),
            ))
            .unwrap();

        assert!(matches!(
            graph.validate().unwrap_err(),
            ProvisionError::UnresolvedDependency { .. }
        ));
    }

    #[test]
    fn test_invalid_config_rejected_before_graph() {
        let config = DeploymentConfig {
            ttl_minutes: 0,
            ..Default::default()
        };
        assert!(matches!(
            build_graph(&config).unwrap_err(),
            ProvisionError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn test_every_kind_present() {
        let graph = build_graph(&DeploymentConfig::default()).unwrap();
        let kinds: Vec<ResourceKind> = graph.nodes().iter().map(ResourceNode::kind).collect();
        for kind in [
            ResourceKind::Network,
            ResourceKind::Cluster,
            ResourceKind::Service,
            ResourceKind::ScalingPolicy,
            ResourceKind::ScheduledTrigger,
            ResourceKind::ManagementAction,
            ResourceKind::LifetimeGuard,
            ResourceKind::NetworkRule,
        ] {
            assert!(kinds.contains(&kind), "missing {kind}");
        }
    }
}
