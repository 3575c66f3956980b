//! Scheduled load-generation trigger
//!
//! Runs a short-lived task on a fixed schedule that sends traffic to the
//! service's internal discovery name. The trigger is only meaningful once the
//! service is registered for discovery, so resolution rejects a trigger that
//! does not depend on a discoverable service.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ProvisionError, Result};
use crate::graph::ResolutionContext;
use crate::models::{NodeId, NodeSpec, ResourceNode, ServiceSpec};

/// Fire schedule, rendered in the platform's rate/cron expression syntax
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Rate(Duration),
    /// Six fields: minutes hours day-of-month month day-of-week year
    Cron(String),
}

impl Schedule {
    pub fn every_minutes(minutes: u64) -> Self {
        Schedule::Rate(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn expression(&self) -> String {
        match self {
            Schedule::Rate(every) => match every.as_secs() / 60 {
                1 => "rate(1 minute)".to_string(),
                n => format!("rate({} minutes)", n),
            },
            Schedule::Cron(fields) => format!("cron({})", fields),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        match self {
            Schedule::Rate(every) => {
                if every.is_zero() {
                    return Err(ConfigError::new("schedule", "rate must be positive"));
                }
                if every.as_secs() % 60 != 0 || every.subsec_nanos() != 0 {
                    return Err(ConfigError::new(
                        "schedule",
                        format!("rate {:?} is not a whole number of minutes", every),
                    ));
                }
                Ok(())
            }
            Schedule::Cron(fields) => {
                let count = fields.split_whitespace().count();
                if count != 6 {
                    return Err(ConfigError::new(
                        "schedule",
                        format!("cron expression has {} fields, expected 6", count),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTriggerSpec {
    pub schedule: Schedule,
    /// Service the trigger sends traffic to
    pub target_service: NodeId,
    /// Internal address, built from the service's discovery registration
    pub target_address: Url,
    /// Command run by the load-generation task
    pub command: Vec<String>,
    /// Tasks started per firing; zero pauses the trigger without removing it
    pub desired_concurrency: u32,
}

impl ScheduledTriggerSpec {
    /// Build a trigger aimed at the discovery address of `service`
    pub fn for_service(
        service_id: &NodeId,
        service: &ServiceSpec,
        schedule: Schedule,
        command: Vec<String>,
        desired_concurrency: u32,
    ) -> Result<Self> {
        let hostname = service.discovery_hostname().ok_or_else(|| {
            ProvisionError::unresolved(
                service_id,
                service_id,
                "service has no discovery registration to target",
            )
        })?;
        let address = format!(
            "http://{}:{}{}",
            hostname, service.container_port, service.health_check_path
        );
        let target_address = Url::parse(&address).map_err(|e| {
            ProvisionError::invalid(service_id, format!("bad target address {address}: {e}"))
        })?;

        Ok(Self {
            schedule,
            target_service: service_id.clone(),
            target_address,
            command,
            desired_concurrency,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.schedule.validate()?;
        if self.target_address.host_str().is_none() {
            return Err(ConfigError::new("target_address", "has no host"));
        }
        Ok(())
    }
}

/// The target must be a declared, discoverable service that the trigger
/// depends on, and the trigger's address must name that registration.
pub(crate) fn check_resolution(
    node: &ResourceNode,
    spec: &ScheduledTriggerSpec,
    ctx: &ResolutionContext<'_>,
) -> Result<()> {
    let target = &spec.target_service;
    let service = match ctx.node(target).map(|n| &n.spec) {
        Some(NodeSpec::Service(service)) => service,
        Some(other) => {
            return Err(ProvisionError::unresolved(
                &node.id,
                target,
                format!("target is a {}, not a service", other.kind()),
            ))
        }
        None => {
            return Err(ProvisionError::unresolved(
                &node.id,
                target,
                "target service is not declared in graph",
            ))
        }
    };

    if !ctx.depends_on(&node.id, target) {
        return Err(ProvisionError::unresolved(
            &node.id,
            target,
            "trigger must depend on its target service",
        ));
    }

    let hostname = service.discovery_hostname().ok_or_else(|| {
        ProvisionError::unresolved(&node.id, target, "target service is not discoverable")
    })?;

    if spec.target_address.host_str() != Some(hostname.as_str()) {
        return Err(ProvisionError::unresolved(
            &node.id,
            target,
            format!(
                "address {} does not match discovery name {}",
                spec.target_address, hostname
            ),
        ));
    }
    Ok(())
}
