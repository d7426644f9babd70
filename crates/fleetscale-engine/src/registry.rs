//! Node registry: where materialized worker nodes live.
//!
//! The engine only needs to add and remove nodes and to ask whether a
//! node's computer is busy. [`InMemoryRegistry`] is the built-in
//! implementation used by the daemon.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleetscale_state::{ComputerInfo, InstanceId, WorkerNode};
use tracing::debug;

use crate::error::RegistryError;

pub trait NodeRegistry: Send + Sync {
    fn add_node(&self, node: WorkerNode) -> Result<(), RegistryError>;

    /// Remove the node backed by `instance_id`. Returns whether it existed.
    fn remove_node(&self, instance_id: &str) -> bool;

    fn get_computer(&self, instance_id: &str) -> Option<ComputerInfo>;

    fn list_computers(&self) -> Vec<ComputerInfo>;
}

struct Entry {
    node: WorkerNode,
    computer: ComputerInfo,
}

/// Registry kept in process memory, keyed by instance id.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<BTreeMap<InstanceId, Entry>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_node(&self, instance_id: &str) -> Option<WorkerNode> {
        self.read().get(instance_id).map(|e| e.node.clone())
    }

    pub fn list_nodes(&self) -> Vec<WorkerNode> {
        self.read().values().map(|e| e.node.clone()).collect()
    }

    /// Mark a computer as running a build.
    pub fn mark_busy(&self, instance_id: &str) -> bool {
        match self.write().get_mut(instance_id) {
            Some(entry) => {
                entry.computer.busy = true;
                entry.computer.idle_since = None;
                true
            }
            None => false,
        }
    }

    /// Mark a computer idle as of `now` (unix seconds).
    pub fn mark_idle(&self, instance_id: &str, now: u64) -> bool {
        match self.write().get_mut(instance_id) {
            Some(entry) => {
                if entry.computer.busy || entry.computer.idle_since.is_none() {
                    entry.computer.idle_since = Some(now);
                }
                entry.computer.busy = false;
                true
            }
            None => false,
        }
    }

    /// Count one finished build against the computer's usage budget.
    pub fn record_use(&self, instance_id: &str) -> Option<u32> {
        let mut entries = self.write();
        let entry = entries.get_mut(instance_id)?;
        entry.computer.uses = entry.computer.uses.saturating_add(1);
        Some(entry.computer.uses)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<InstanceId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<InstanceId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NodeRegistry for InMemoryRegistry {
    fn add_node(&self, node: WorkerNode) -> Result<(), RegistryError> {
        let mut entries = self.write();
        if entries.contains_key(&node.instance_id) {
            return Err(RegistryError::AlreadyRegistered(node.instance_id));
        }
        let computer = ComputerInfo {
            instance_id: node.instance_id.clone(),
            node_name: node.name.clone(),
            fleet_id: node.fleet_id.clone(),
            busy: false,
            idle_since: Some(node.created_at),
            uses: 0,
            max_total_uses: node.max_total_uses,
        };
        debug!(instance_id = %node.instance_id, executors = node.num_executors, "node registered");
        entries.insert(node.instance_id.clone(), Entry { node, computer });
        Ok(())
    }

    fn remove_node(&self, instance_id: &str) -> bool {
        let removed = self.write().remove(instance_id).is_some();
        if removed {
            debug!(%instance_id, "node removed");
        }
        removed
    }

    fn get_computer(&self, instance_id: &str) -> Option<ComputerInfo> {
        self.read().get(instance_id).map(|e| e.computer.clone())
    }

    fn list_computers(&self) -> Vec<ComputerInfo> {
        self.read().values().map(|e| e.computer.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> WorkerNode {
        WorkerNode {
            name: id.to_string(),
            instance_id: id.to_string(),
            fleet_id: "sfr-1".to_string(),
            num_executors: 2,
            labels: vec!["linux".to_string()],
            instance_type: Some("m5.large".to_string()),
            private_ip: None,
            max_total_uses: Some(3),
            created_at: 1000,
        }
    }

    #[test]
    fn add_and_get() {
        let registry = InMemoryRegistry::new();
        registry.add_node(node("i-1")).unwrap();

        let computer = registry.get_computer("i-1").unwrap();
        assert!(computer.is_idle());
        assert_eq!(computer.idle_since, Some(1000));
        assert_eq!(computer.max_total_uses, Some(3));
        assert_eq!(registry.get_node("i-1").unwrap().num_executors, 2);
        assert!(registry.get_computer("i-2").is_none());
    }

    #[test]
    fn duplicate_add_rejected() {
        let registry = InMemoryRegistry::new();
        registry.add_node(node("i-1")).unwrap();
        assert_eq!(
            registry.add_node(node("i-1")),
            Err(RegistryError::AlreadyRegistered("i-1".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn busy_and_idle_transitions() {
        let registry = InMemoryRegistry::new();
        registry.add_node(node("i-1")).unwrap();

        assert!(registry.mark_busy("i-1"));
        let computer = registry.get_computer("i-1").unwrap();
        assert!(!computer.is_idle());
        assert_eq!(computer.idle_since, None);

        assert!(registry.mark_idle("i-1", 2000));
        assert_eq!(registry.get_computer("i-1").unwrap().idle_since, Some(2000));

        // Staying idle keeps the original timestamp.
        assert!(registry.mark_idle("i-1", 3000));
        assert_eq!(registry.get_computer("i-1").unwrap().idle_since, Some(2000));

        assert!(!registry.mark_busy("i-404"));
    }

    #[test]
    fn record_use_counts_towards_budget() {
        let registry = InMemoryRegistry::new();
        registry.add_node(node("i-1")).unwrap();
        for _ in 0..3 {
            registry.record_use("i-1");
        }
        assert!(registry.get_computer("i-1").unwrap().uses_exhausted());
        assert_eq!(registry.record_use("i-404"), None);
    }

    #[test]
    fn remove_node() {
        let registry = InMemoryRegistry::new();
        registry.add_node(node("i-1")).unwrap();
        assert!(registry.remove_node("i-1"));
        assert!(!registry.remove_node("i-1"));
        assert!(registry.is_empty());
        assert!(registry.list_computers().is_empty());
    }
}
