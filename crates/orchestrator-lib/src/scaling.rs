//! Target-tracking autoscaling policy
//!
//! Declares, but does not execute, a closed-loop policy holding average CPU
//! utilization near a target within `[min_capacity, max_capacity]`. The
//! platform's controller mutates capacity at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::NodeId;

/// Metric the policy tracks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    #[default]
    CpuUtilization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicySpec {
    /// Service whose task count is scaled
    pub target_service: NodeId,
    pub metric: ScalingMetric,
    pub target_utilization_percent: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// Delay before another scale-in after a scaling activity
    pub scale_in_cooldown: Duration,
    /// Delay before another scale-out after a scaling activity
    pub scale_out_cooldown: Duration,
}

impl ScalingPolicySpec {
    pub fn cpu(target_service: impl Into<NodeId>) -> Self {
        Self {
            target_service: target_service.into(),
            metric: ScalingMetric::CpuUtilization,
            target_utilization_percent: 50.0,
            min_capacity: 1,
            max_capacity: 3,
            scale_in_cooldown: Duration::from_secs(60),
            scale_out_cooldown: Duration::from_secs(60),
        }
    }

    pub fn target(mut self, percent: f64) -> Self {
        self.target_utilization_percent = percent;
        self
    }

    pub fn capacity(mut self, min: u32, max: u32) -> Self {
        self.min_capacity = min;
        self.max_capacity = max;
        self
    }

    pub fn cooldowns(mut self, scale_in: Duration, scale_out: Duration) -> Self {
        self.scale_in_cooldown = scale_in;
        self.scale_out_cooldown = scale_out;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let target = self.target_utilization_percent;
        if !(target > 0.0 && target <= 100.0) {
            return Err(ConfigError::new(
                "target_utilization_percent",
                format!("{} is outside (0, 100]", target),
            ));
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::new("max_capacity", "must be at least 1"));
        }
        if self.min_capacity > self.max_capacity {
            return Err(ConfigError::new(
                "min_capacity",
                format!(
                    "min_capacity {} exceeds max_capacity {}",
                    self.min_capacity, self.max_capacity
                ),
            ));
        }
        Ok(())
    }
}
