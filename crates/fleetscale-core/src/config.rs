//! fleet.toml configuration parser.
//!
//! Numeric bounds are kept as signed, optional values so that malformed
//! input (negative sizes, zero executors) still parses; the engine
//! normalizes them when it builds its scaling config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration_secs;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8470";
pub const DEFAULT_UPDATE_INTERVAL: &str = "10s";
pub const DEFAULT_RETENTION_INTERVAL: &str = "60s";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub fleet: FleetSection,
    pub scaling: Option<ScalingSection>,
    pub daemon: Option<DaemonSection>,
    pub simulated: Option<SimulatedSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSection {
    pub id: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub credentials_id: Option<String>,
    /// Backend kind; only "simulated" is built in.
    pub backend: Option<String>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingSection {
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub min_spare_size: Option<i64>,
    pub executors_per_unit: Option<i64>,
    /// "flat", "weighted" or "hardware_ratio".
    pub policy: Option<String>,
    pub weight_scaling: Option<bool>,
    pub vcpus_per_executor: Option<f64>,
    pub memory_gib_per_executor: Option<f64>,
    /// Seconds before an unfulfilled planned unit is cancelled; <= 0 disables.
    pub planned_timeout_secs: Option<i64>,
    /// Minutes a node may stay idle before it is scheduled for termination; 0 disables.
    pub idle_minutes: Option<i64>,
    pub max_total_uses: Option<i64>,
    /// Only serve demand whose label matches one of `[fleet] labels`.
    pub restrict_usage: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Reconciliation interval (e.g., "10s").
    pub update_interval: Option<String>,
    /// Idle-retention check interval (e.g., "60s").
    pub retention_interval: Option<String>,
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedSection {
    pub instance_type: Option<String>,
    pub vcpus: Option<u32>,
    pub memory_mib: Option<u64>,
    pub initial_capacity: Option<u32>,
    pub auto_scaling_group: Option<bool>,
    pub weights: Option<HashMap<String, f64>>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a fleet.toml for a simulated fleet.
    pub fn scaffold(fleet_id: &str, region: &str) -> Self {
        FleetConfig {
            fleet: FleetSection {
                id: fleet_id.to_string(),
                region: region.to_string(),
                endpoint: None,
                credentials_id: None,
                backend: Some("simulated".to_string()),
                labels: Some(vec!["fleet".to_string()]),
            },
            scaling: Some(ScalingSection {
                min_size: Some(0),
                max_size: Some(10),
                min_spare_size: Some(0),
                executors_per_unit: Some(1),
                policy: Some("flat".to_string()),
                weight_scaling: Some(false),
                vcpus_per_executor: None,
                memory_gib_per_executor: None,
                planned_timeout_secs: Some(300),
                idle_minutes: Some(10),
                max_total_uses: None,
                restrict_usage: Some(false),
            }),
            daemon: Some(DaemonSection {
                update_interval: Some(DEFAULT_UPDATE_INTERVAL.to_string()),
                retention_interval: Some(DEFAULT_RETENTION_INTERVAL.to_string()),
                listen: Some(DEFAULT_LISTEN.to_string()),
            }),
            simulated: Some(SimulatedSection {
                instance_type: Some("m5.large".to_string()),
                vcpus: Some(2),
                memory_mib: Some(8192),
                initial_capacity: Some(0),
                auto_scaling_group: Some(false),
                weights: None,
            }),
        }
    }

    pub fn backend_kind(&self) -> &str {
        self.fleet.backend.as_deref().unwrap_or("simulated")
    }

    pub fn labels(&self) -> Vec<String> {
        self.fleet.labels.clone().unwrap_or_default()
    }

    pub fn scaling(&self) -> ScalingSection {
        self.scaling.clone().unwrap_or_default()
    }

    pub fn update_interval(&self) -> Duration {
        let raw = self
            .daemon
            .as_ref()
            .and_then(|d| d.update_interval.as_deref())
            .unwrap_or(DEFAULT_UPDATE_INTERVAL);
        Duration::from_secs(parse_duration_secs(raw).max(1))
    }

    pub fn retention_interval(&self) -> Duration {
        let raw = self
            .daemon
            .as_ref()
            .and_then(|d| d.retention_interval.as_deref())
            .unwrap_or(DEFAULT_RETENTION_INTERVAL);
        Duration::from_secs(parse_duration_secs(raw).max(1))
    }

    pub fn listen(&self) -> String {
        self.daemon
            .as_ref()
            .and_then(|d| d.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
    }
}
