//! Domain types for fleet capacity management.
//!
//! These types describe the remote fleet (snapshots, instances), the
//! worker nodes materialized from it, and the computers the node registry
//! reports back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Identifier of a remote fleet (spot fleet request id, ASG name, ...).
pub type FleetId = String;

/// Identifier of a single remote compute instance.
pub type InstanceId = String;

// ── Fleet ─────────────────────────────────────────────────────────

/// Addressing tuple handed to every remote backend call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FleetTarget {
    pub region: String,
    /// Custom API endpoint, if the default regional one is not used.
    pub endpoint: Option<String>,
    /// Opaque reference to credentials resolved by the backend.
    pub credentials_id: Option<String>,
    pub fleet_id: FleetId,
}

/// Lifecycle state of the remote fleet as reported by the cloud API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    Active,
    Submitted,
    Modifying,
    Cancelled,
    CancelledRunning,
    CancelledTerminating,
    Failed,
    Error,
    Unknown,
}

impl FleetState {
    /// Parse a remote status string.
    ///
    /// Matching is case-insensitive and treats `-` and `_` alike. Anything
    /// unrecognized maps to [`FleetState::Unknown`].
    pub fn parse(s: &str) -> Self {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "active" => FleetState::Active,
            "submitted" => FleetState::Submitted,
            "modifying" => FleetState::Modifying,
            "cancelled" => FleetState::Cancelled,
            "cancelled_running" => FleetState::CancelledRunning,
            "cancelled_terminating" => FleetState::CancelledTerminating,
            "failed" => FleetState::Failed,
            "error" => FleetState::Error,
            _ => FleetState::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        self == FleetState::Active
    }
}

impl fmt::Display for FleetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FleetState::Active => "active",
            FleetState::Submitted => "submitted",
            FleetState::Modifying => "modifying",
            FleetState::Cancelled => "cancelled",
            FleetState::CancelledRunning => "cancelled_running",
            FleetState::CancelledTerminating => "cancelled_terminating",
            FleetState::Failed => "failed",
            FleetState::Error => "error",
            FleetState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Last known remote state of a fleet.
///
/// `instance_ids` is the sole source of truth for which units exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetStateSnapshot {
    pub fleet_id: FleetId,
    /// Target capacity last known.
    pub num_desired: u32,
    pub state: FleetState,
    pub instance_ids: BTreeSet<InstanceId>,
    /// Instance type → advertised weight, for weighted scaling.
    #[serde(default)]
    pub instance_type_weights: HashMap<String, f64>,
}

impl FleetStateSnapshot {
    pub fn new(
        fleet_id: impl Into<FleetId>,
        num_desired: u32,
        state: FleetState,
        instance_ids: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        Self {
            fleet_id: fleet_id.into(),
            num_desired,
            state,
            instance_ids: instance_ids.into_iter().collect(),
            instance_type_weights: HashMap::new(),
        }
    }

    pub fn with_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.instance_type_weights = weights;
        self
    }

    /// Copy of this snapshot with a different target capacity.
    pub fn with_num_desired(&self, num_desired: u32) -> Self {
        Self {
            num_desired,
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instance_ids.contains(instance_id)
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Hardware profile of a remote instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: InstanceId,
    pub instance_type: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub private_ip: Option<String>,
}

impl InstanceDescription {
    pub fn memory_gib(&self) -> f64 {
        self.memory_mib as f64 / 1024.0
    }
}

/// Why an instance was scheduled for termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    IdleTooLong,
    MaxUsesExhausted,
    AgentDeleted,
    Manual,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::IdleTooLong => "idle_too_long",
            TerminationReason::MaxUsesExhausted => "max_uses_exhausted",
            TerminationReason::AgentDeleted => "agent_deleted",
            TerminationReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// A worker node materialized from a fleet instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    /// Node name; equal to the instance id.
    pub name: String,
    pub instance_id: InstanceId,
    pub fleet_id: FleetId,
    pub num_executors: u32,
    pub labels: Vec<String>,
    pub instance_type: Option<String>,
    pub private_ip: Option<String>,
    /// Builds the node may run before it must be recycled.
    pub max_total_uses: Option<u32>,
    /// Unix timestamp (seconds) when the node was created.
    pub created_at: u64,
}

/// Runtime view of a registered node, as reported by the node registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputerInfo {
    pub instance_id: InstanceId,
    pub node_name: String,
    pub fleet_id: FleetId,
    pub busy: bool,
    /// Unix timestamp (seconds) since which the computer has been idle.
    pub idle_since: Option<u64>,
    /// Builds run so far.
    pub uses: u32,
    pub max_total_uses: Option<u32>,
}

impl ComputerInfo {
    pub fn is_idle(&self) -> bool {
        !self.busy
    }

    pub fn uses_exhausted(&self) -> bool {
        matches!(self.max_total_uses, Some(max) if self.uses >= max)
    }
}
