//! Normalized scaling configuration.

use std::time::Duration;

use fleetscale_core::config::ScalingSection;
use serde::Serialize;
use tracing::warn;

use crate::policy::ExecutorScaling;

/// Size bounds and executor policy for one fleet.
///
/// Built once at engine construction and read-only afterwards. Malformed
/// values are coerced rather than rejected so the control loop always runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingConfig {
    pub min_size: u32,
    pub min_spare_size: u32,
    pub max_size: u32,
    pub num_executors_per_unit: u32,
    pub weight_scaling_enabled: bool,
    pub policy: ExecutorScaling,
    /// `None` disables planned-unit timeouts.
    pub planned_unit_timeout: Option<Duration>,
    /// `None` disables idle-based termination.
    pub idle_timeout: Option<Duration>,
    pub max_total_uses: Option<u32>,
    pub labels: Vec<String>,
    /// Refuse unlabeled demand.
    pub restrict_usage: bool,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            min_spare_size: 0,
            max_size: 10,
            num_executors_per_unit: 1,
            weight_scaling_enabled: false,
            policy: ExecutorScaling::Flat,
            planned_unit_timeout: Some(Duration::from_secs(300)),
            idle_timeout: None,
            max_total_uses: None,
            labels: Vec::new(),
            restrict_usage: false,
        }
    }
}

impl ScalingConfig {
    /// Build a config from the `[scaling]` section of fleet.toml.
    pub fn from_section(section: &ScalingSection, labels: Vec<String>) -> Self {
        let defaults = ScalingConfig::default();

        let min_size = non_negative(section.min_size).unwrap_or(defaults.min_size);
        let mut max_size = non_negative(section.max_size).unwrap_or(defaults.max_size);
        if max_size < min_size {
            warn!(min_size, max_size, "max_size below min_size, raising to min_size");
            max_size = min_size;
        }

        let num_executors_per_unit = match section.executors_per_unit {
            Some(n) if n >= 1 => u32::try_from(n).unwrap_or(u32::MAX),
            Some(n) => {
                warn!(executors_per_unit = n, "non-positive executor count, using 1");
                1
            }
            None => 1,
        };

        let policy = match section.policy.as_deref().map(str::trim) {
            None | Some("") | Some("flat") => ExecutorScaling::Flat,
            Some("weighted") => ExecutorScaling::Weighted,
            Some("hardware_ratio") => ExecutorScaling::HardwareRatio {
                vcpus_per_executor: section.vcpus_per_executor.unwrap_or(0.0),
                memory_gib_per_executor: section.memory_gib_per_executor.unwrap_or(0.0),
            },
            Some(other) => {
                warn!(policy = %other, "unknown executor scaling policy, using flat");
                ExecutorScaling::Flat
            }
        };

        let planned_unit_timeout = match section.planned_timeout_secs {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
            Some(_) => None,
            None => defaults.planned_unit_timeout,
        };

        let idle_timeout = match section.idle_minutes {
            Some(mins) if mins > 0 => Some(Duration::from_secs(mins as u64 * 60)),
            _ => None,
        };

        Self {
            min_size,
            min_spare_size: non_negative(section.min_spare_size).unwrap_or(0),
            max_size,
            num_executors_per_unit,
            weight_scaling_enabled: section.weight_scaling.unwrap_or(false),
            policy,
            planned_unit_timeout,
            idle_timeout,
            max_total_uses: section
                .max_total_uses
                .filter(|uses| *uses > 0)
                .map(|uses| u32::try_from(uses).unwrap_or(u32::MAX)),
            labels,
            restrict_usage: section.restrict_usage.unwrap_or(false),
        }
    }

    /// The policy actually applied: weight scaling upgrades a flat policy.
    pub fn effective_policy(&self) -> ExecutorScaling {
        match self.policy {
            ExecutorScaling::Flat if self.weight_scaling_enabled => ExecutorScaling::Weighted,
            other => other,
        }
    }

    /// Whether demand carrying `label` may be served by this fleet.
    ///
    /// Unlabeled demand is accepted unless usage is restricted. Labeled
    /// demand must name one of the fleet's labels.
    pub fn serves_label(&self, label: Option<&str>) -> bool {
        match label {
            None => !self.restrict_usage,
            Some(label) => self.labels.iter().any(|l| l == label),
        }
    }

    pub fn clamp_target(&self, target: i64) -> u32 {
        target.clamp(self.min_size as i64, self.max_size as i64) as u32
    }
}

fn non_negative(value: Option<i64>) -> Option<u32> {
    value.map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX))
}
