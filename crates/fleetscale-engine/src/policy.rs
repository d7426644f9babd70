//! Executor scaling policies.
//!
//! Maps a unit's hardware profile to the number of logical executors the
//! node created for it should offer.

use std::collections::HashMap;

use fleetscale_state::InstanceDescription;
use serde::{Deserialize, Serialize};

/// How many executors a unit provides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorScaling {
    /// Every unit offers `num_executors_per_unit`.
    Flat,
    /// Use the fleet's advertised weight for the unit's instance type.
    Weighted,
    /// Derive the count from vCPUs and memory.
    HardwareRatio {
        vcpus_per_executor: f64,
        memory_gib_per_executor: f64,
    },
}

impl ExecutorScaling {
    /// Compute the executor count for a unit.
    ///
    /// `unit` is `None` when the instance could not be described; every
    /// variant then falls back to the flat count. The result is at least 1.
    pub fn executors_for(
        &self,
        num_executors_per_unit: u32,
        unit: Option<&InstanceDescription>,
        weights: &HashMap<String, f64>,
    ) -> u32 {
        let flat = num_executors_per_unit.max(1);
        let Some(unit) = unit else {
            return flat;
        };

        match *self {
            ExecutorScaling::Flat => flat,
            ExecutorScaling::Weighted => match weights.get(&unit.instance_type) {
                Some(weight) => floor_at_least_one(*weight),
                None => flat,
            },
            ExecutorScaling::HardwareRatio {
                vcpus_per_executor,
                memory_gib_per_executor,
            } => {
                let from_cpu = ratio_count(unit.vcpus as f64, vcpus_per_executor);
                let from_mem = ratio_count(unit.memory_gib(), memory_gib_per_executor);
                let count = match (from_cpu, from_mem) {
                    (0, 0) => flat,
                    (0, m) => m,
                    (c, 0) => c,
                    (c, m) => c.min(m),
                };
                count.max(1)
            }
        }
    }
}

fn floor_at_least_one(weight: f64) -> u32 {
    if weight.is_finite() && weight >= 1.0 {
        weight.floor() as u32
    } else {
        1
    }
}

/// `floor(amount / ratio)`, or 0 when the ratio is unset.
fn ratio_count(amount: f64, ratio: f64) -> u32 {
    if !(ratio.is_finite() && ratio > 0.0) {
        return 0;
    }
    (amount / ratio).floor().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(instance_type: &str, vcpus: u32, memory_mib: u64) -> InstanceDescription {
        InstanceDescription {
            instance_id: "i-1".to_string(),
            instance_type: instance_type.to_string(),
            vcpus,
            memory_mib,
            private_ip: None,
        }
    }

    fn weights(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn flat_returns_configured_count() {
        let u = unit("m5.large", 2, 8192);
        assert_eq!(ExecutorScaling::Flat.executors_for(3, Some(&u), &HashMap::new()), 3);
    }

    #[test]
    fn flat_coerces_zero_to_one() {
        assert_eq!(ExecutorScaling::Flat.executors_for(0, None, &HashMap::new()), 1);
    }

    #[test]
    fn weighted_floors_weight() {
        let u = unit("t", 2, 4096);
        let policy = ExecutorScaling::Weighted;
        assert_eq!(policy.executors_for(5, Some(&u), &weights(&[("t", 1.44)])), 1);
        assert_eq!(policy.executors_for(5, Some(&u), &weights(&[("t", 1.5)])), 1);
        assert_eq!(policy.executors_for(5, Some(&u), &weights(&[("t", 2.0)])), 2);
    }

    #[test]
    fn weighted_clamps_small_weight_to_one() {
        let u = unit("t", 2, 4096);
        assert_eq!(
            ExecutorScaling::Weighted.executors_for(5, Some(&u), &weights(&[("t", 0.4)])),
            1
        );
    }

    #[test]
    fn weighted_missing_type_falls_back_to_flat() {
        let u = unit("c5.xlarge", 4, 8192);
        assert_eq!(
            ExecutorScaling::Weighted.executors_for(2, Some(&u), &weights(&[("t", 3.0)])),
            2
        );
    }

    #[test]
    fn hardware_ratio_takes_minimum() {
        let u = unit("m5.large", 2, 4096);
        let policy = ExecutorScaling::HardwareRatio {
            vcpus_per_executor: 1.0,
            memory_gib_per_executor: 1.0,
        };
        assert_eq!(policy.executors_for(7, Some(&u), &HashMap::new()), 2);
    }

    #[test]
    fn hardware_ratio_uses_single_candidate() {
        let u = unit("r5.2xlarge", 8, 65536);
        let cpu_only = ExecutorScaling::HardwareRatio {
            vcpus_per_executor: 2.0,
            memory_gib_per_executor: 0.0,
        };
        assert_eq!(cpu_only.executors_for(1, Some(&u), &HashMap::new()), 4);

        let mem_only = ExecutorScaling::HardwareRatio {
            vcpus_per_executor: 0.0,
            memory_gib_per_executor: 16.0,
        };
        assert_eq!(mem_only.executors_for(1, Some(&u), &HashMap::new()), 4);
    }

    #[test]
    fn hardware_ratio_unset_falls_back_to_flat() {
        let u = unit("m5.large", 2, 8192);
        let policy = ExecutorScaling::HardwareRatio {
            vcpus_per_executor: 0.0,
            memory_gib_per_executor: -1.0,
        };
        assert_eq!(policy.executors_for(3, Some(&u), &HashMap::new()), 3);
    }

    #[test]
    fn hardware_ratio_never_returns_zero() {
        // 1 vCPU with 4 vCPUs per executor floors to 0, memory unset.
        let u = unit("t3.micro", 1, 1024);
        let policy = ExecutorScaling::HardwareRatio {
            vcpus_per_executor: 4.0,
            memory_gib_per_executor: 0.0,
        };
        assert_eq!(policy.executors_for(3, Some(&u), &HashMap::new()), 3);
    }

    #[test]
    fn undescribed_unit_uses_flat() {
        let policy = ExecutorScaling::Weighted;
        assert_eq!(policy.executors_for(4, None, &weights(&[("t", 8.0)])), 4);
    }
}
