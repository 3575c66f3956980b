//! Deployment configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{IdempotencyKeyStrategy, InvokerConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::orchestrator::OrchestratorConfig;
use crate::scaling::ScalingPolicySpec;
use crate::trigger::Schedule;

/// Longest deployment lifetime accepted, 30 days
pub const MAX_TTL_MINUTES: u64 = 30 * 24 * 60;

/// Longest trigger interval accepted, one year
pub const MAX_SCHEDULE_RATE_MINUTES: u64 = 365 * 24 * 60;

/// Options recognized by the load-test deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Name used for the stack in logs and status
    #[serde(default = "default_stack_name")]
    pub stack_name: String,

    /// Hard lifetime of the whole deployment
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    /// Average CPU utilization the scaling policy holds
    #[serde(default = "default_target_utilization")]
    pub target_utilization_percent: f64,

    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    #[serde(default = "default_cooldown_secs")]
    pub scale_in_cooldown_secs: u64,

    #[serde(default = "default_cooldown_secs")]
    pub scale_out_cooldown_secs: u64,

    /// Minutes between load-generation runs
    #[serde(default = "default_schedule_rate")]
    pub schedule_rate_minutes: u64,

    #[serde(default = "default_trigger_concurrency")]
    pub trigger_concurrency: u32,

    #[serde(default)]
    pub idempotency_key_strategy: IdempotencyKeyStrategy,

    /// Nodes applied at the same time within a stage
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Largest management action output kept in the ledger
    #[serde(default = "default_max_action_output_bytes")]
    pub max_action_output_bytes: usize,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Where the idempotency ledger is persisted; in memory when unset
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,

    #[serde(default = "default_site_domain")]
    pub site_domain: String,

    #[serde(default = "default_dns_name")]
    pub dns_name: String,

    #[serde(default = "default_container_image")]
    pub container_image: String,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_cpu_units")]
    pub cpu_units: u32,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    #[serde(default = "default_max_azs")]
    pub max_azs: u8,

    #[serde(default = "default_subnet_cidr_mask")]
    pub subnet_cidr_mask: u8,

    /// Private namespace the service registers in
    #[serde(default = "default_discovery_namespace")]
    pub discovery_namespace: String,

    /// Port for the driver's health, metrics and status API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_stack_name() -> String {
    "AwsFargateClusterStack".to_string()
}

fn default_ttl_minutes() -> u64 {
    120
}

fn default_target_utilization() -> f64 {
    50.0
}

fn default_min_capacity() -> u32 {
    1
}

fn default_max_capacity() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_schedule_rate() -> u64 {
    1
}

fn default_trigger_concurrency() -> u32 {
    1
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_action_output_bytes() -> usize {
    4096
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial_backoff_ms() -> u64 {
    500
}

fn default_retry_max_backoff_ms() -> u64 {
    30_000
}

fn default_site_domain() -> String {
    "belisleonline.com".to_string()
}

fn default_dns_name() -> String {
    "fargate-loadtest".to_string()
}

fn default_container_image() -> String {
    "jmb12686/go-loadtest-api".to_string()
}

fn default_container_port() -> u16 {
    8000
}

fn default_cpu_units() -> u32 {
    256
}

fn default_memory_mib() -> u32 {
    512
}

fn default_health_check_path() -> String {
    "/hello".to_string()
}

fn default_log_retention_days() -> u32 {
    60
}

fn default_max_azs() -> u8 {
    3
}

fn default_subnet_cidr_mask() -> u8 {
    24
}

fn default_discovery_namespace() -> String {
    "loadtest.local".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            stack_name: default_stack_name(),
            ttl_minutes: default_ttl_minutes(),
            target_utilization_percent: default_target_utilization(),
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
            scale_in_cooldown_secs: default_cooldown_secs(),
            scale_out_cooldown_secs: default_cooldown_secs(),
            schedule_rate_minutes: default_schedule_rate(),
            trigger_concurrency: default_trigger_concurrency(),
            idempotency_key_strategy: IdempotencyKeyStrategy::default(),
            max_concurrency: default_max_concurrency(),
            max_action_output_bytes: default_max_action_output_bytes(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            ledger_path: None,
            site_domain: default_site_domain(),
            dns_name: default_dns_name(),
            container_image: default_container_image(),
            container_port: default_container_port(),
            cpu_units: default_cpu_units(),
            memory_mib: default_memory_mib(),
            health_check_path: default_health_check_path(),
            log_retention_days: default_log_retention_days(),
            max_azs: default_max_azs(),
            subnet_cidr_mask: default_subnet_cidr_mask(),
            discovery_namespace: default_discovery_namespace(),
            api_port: default_api_port(),
        }
    }
}

impl DeploymentConfig {
    /// Reject configurations that could never produce a valid graph
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_minutes == 0 {
            return Err(ConfigError::new("ttl_minutes", "must be greater than zero"));
        }
        if self.ttl_minutes > MAX_TTL_MINUTES {
            return Err(ConfigError::new(
                "ttl_minutes",
                format!("must be at most {} (30 days)", MAX_TTL_MINUTES),
            ));
        }
        if self.schedule_rate_minutes > MAX_SCHEDULE_RATE_MINUTES {
            return Err(ConfigError::new(
                "schedule_rate_minutes",
                format!("must be at most {} (one year)", MAX_SCHEDULE_RATE_MINUTES),
            ));
        }
        self.scaling_policy("service").validate()?;
        self.schedule().validate()?;
        if self.max_concurrency == 0 {
            return Err(ConfigError::new("max_concurrency", "must be at least 1"));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::new("retry_max_attempts", "must be at least 1"));
        }
        if self.container_port == 0 {
            return Err(ConfigError::new("container_port", "must be non-zero"));
        }
        if self.subnet_cidr_mask == 0 || self.subnet_cidr_mask > 32 {
            return Err(ConfigError::new(
                "subnet_cidr_mask",
                format!("{} is not a valid prefix length", self.subnet_cidr_mask),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::every_minutes(self.schedule_rate_minutes)
    }

    pub fn scaling_policy(&self, target_service: &str) -> ScalingPolicySpec {
        ScalingPolicySpec::cpu(target_service)
            .target(self.target_utilization_percent)
            .capacity(self.min_capacity, self.max_capacity)
            .cooldowns(
                Duration::from_secs(self.scale_in_cooldown_secs),
                Duration::from_secs(self.scale_out_cooldown_secs),
            )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }

    pub fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            retry: self.retry_policy(),
            max_output_bytes: self.max_action_output_bytes,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.max_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DeploymentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), Duration::from_secs(7200));
        assert_eq!(config.schedule().expression(), "rate(1 minute)");
        assert_eq!(
            config.idempotency_key_strategy,
            IdempotencyKeyStrategy::ContentHash
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: DeploymentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DeploymentConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config: DeploymentConfig = serde_json::from_str(
            r#"{"ttl_minutes": 30, "max_capacity": 6, "idempotency_key_strategy": "time_based"}"#,
        )
        .unwrap();
        assert_eq!(config.ttl_minutes, 30);
        assert_eq!(config.max_capacity, 6);
        assert_eq!(config.min_capacity, 1);
        assert_eq!(
            config.idempotency_key_strategy,
            IdempotencyKeyStrategy::TimeBased
        );
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let config = DeploymentConfig {
            ttl_minutes: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "ttl_minutes");
    }

    #[test]
    fn test_rejects_invalid_scaling() {
        let config = DeploymentConfig {
            max_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "max_capacity");

        let config = DeploymentConfig {
            target_utilization_percent: 150.0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field,
            "target_utilization_percent"
        );
    }

    #[test]
    fn test_rejects_zero_schedule_rate() {
        let config = DeploymentConfig {
            schedule_rate_minutes: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "schedule");
    }

    #[test]
    fn test_rejects_ttl_beyond_limit() {
        let config = DeploymentConfig {
            ttl_minutes: u64::MAX / 30,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "ttl_minutes");
        // Conversion saturates instead of wrapping to a short lifetime
        assert!(config.ttl() >= Duration::from_secs(MAX_TTL_MINUTES * 60));

        let config = DeploymentConfig {
            ttl_minutes: MAX_TTL_MINUTES,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn test_rejects_schedule_rate_beyond_limit() {
        let config = DeploymentConfig {
            schedule_rate_minutes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field,
            "schedule_rate_minutes"
        );
    }
}
