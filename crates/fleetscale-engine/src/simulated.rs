//! Simulated fleet: an in-memory backend.
//!
//! Behaves like a spot fleet configured with "no termination" on shrink:
//! raising the target launches instances immediately, lowering it leaves
//! existing instances alone until they are terminated explicitly. Failure
//! injection and call counters make it the backend of choice for tests and
//! for running `fleetd` without cloud credentials.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleetscale_core::config::SimulatedSection;
use fleetscale_state::{
    FleetState, FleetStateSnapshot, FleetTarget, InstanceDescription, InstanceId,
};
use tracing::debug;

use crate::backend::{BackendFuture, FleetBackend, InstanceApi};
use crate::error::BackendError;

/// Called with the requested capacity at the start of every `modify`.
pub type ModifyHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SimulatedFleetOptions {
    pub instance_type: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub initial_capacity: u32,
    pub auto_scaling_group: bool,
    pub weights: HashMap<String, f64>,
}

impl Default for SimulatedFleetOptions {
    fn default() -> Self {
        Self {
            instance_type: "m5.large".to_string(),
            vcpus: 2,
            memory_mib: 8192,
            initial_capacity: 0,
            auto_scaling_group: false,
            weights: HashMap::new(),
        }
    }
}

impl From<&SimulatedSection> for SimulatedFleetOptions {
    fn from(section: &SimulatedSection) -> Self {
        let defaults = SimulatedFleetOptions::default();
        Self {
            instance_type: section
                .instance_type
                .clone()
                .unwrap_or(defaults.instance_type),
            vcpus: section.vcpus.unwrap_or(defaults.vcpus),
            memory_mib: section.memory_mib.unwrap_or(defaults.memory_mib),
            initial_capacity: section.initial_capacity.unwrap_or(0),
            auto_scaling_group: section.auto_scaling_group.unwrap_or(false),
            weights: section.weights.clone().unwrap_or_default(),
        }
    }
}

struct SimState {
    num_desired: u32,
    state: FleetState,
    discovered: bool,
    instances: BTreeMap<InstanceId, InstanceDescription>,
    tags: HashMap<InstanceId, Vec<(String, String)>>,
    next_seq: u64,
    /// Caps live instances below the target, like an exhausted spot pool.
    launch_limit: Option<usize>,
    last_modify: Option<(u32, u32, u32)>,
    get_state_failure: Option<BackendError>,
    modify_failure: Option<BackendError>,
    terminate_failure: Option<BackendError>,
    tag_failure: Option<BackendError>,
    describe_failure: Option<BackendError>,
}

pub struct SimulatedFleet {
    fleet_id: String,
    options: SimulatedFleetOptions,
    state: Mutex<SimState>,
    modify_hook: Mutex<Option<ModifyHook>>,
    modify_calls: AtomicUsize,
    fleet_terminate_calls: AtomicUsize,
    instance_terminate_calls: AtomicUsize,
}

impl SimulatedFleet {
    pub fn new(fleet_id: impl Into<String>, options: SimulatedFleetOptions) -> Self {
        let fleet = Self {
            fleet_id: fleet_id.into(),
            state: Mutex::new(SimState {
                num_desired: 0,
                state: FleetState::Active,
                discovered: true,
                instances: BTreeMap::new(),
                tags: HashMap::new(),
                next_seq: 1,
                launch_limit: None,
                last_modify: None,
                get_state_failure: None,
                modify_failure: None,
                terminate_failure: None,
                tag_failure: None,
                describe_failure: None,
            }),
            options,
            modify_hook: Mutex::new(None),
            modify_calls: AtomicUsize::new(0),
            fleet_terminate_calls: AtomicUsize::new(0),
            instance_terminate_calls: AtomicUsize::new(0),
        };
        let initial = fleet.options.initial_capacity;
        {
            let mut state = fleet.lock_state();
            state.num_desired = initial;
            fleet.launch_to_desired(&mut state);
        }
        fleet
    }

    // ── Test and operator controls ──────────────────────────────────

    pub fn set_state(&self, state: FleetState) {
        self.lock_state().state = state;
    }

    /// Undiscovered fleets report no snapshot at all.
    pub fn set_discovered(&self, discovered: bool) {
        self.lock_state().discovered = discovered;
    }

    /// Change the target capacity out of band (console edit, another tool).
    pub fn set_num_desired(&self, num_desired: u32) {
        let mut state = self.lock_state();
        state.num_desired = num_desired;
        self.launch_to_desired(&mut state);
    }

    /// Stop launching once `limit` instances are live. `None` lifts the cap
    /// and launches up to the current target.
    pub fn set_launch_limit(&self, limit: Option<usize>) {
        let mut state = self.lock_state();
        state.launch_limit = limit;
        self.launch_to_desired(&mut state);
    }

    /// Remove an instance out of band (spot interruption).
    pub fn interrupt_instance(&self, instance_id: &str) -> bool {
        self.lock_state().instances.remove(instance_id).is_some()
    }

    pub fn fail_get_state(&self, error: Option<BackendError>) {
        self.lock_state().get_state_failure = error;
    }

    pub fn fail_modify(&self, error: Option<BackendError>) {
        self.lock_state().modify_failure = error;
    }

    pub fn fail_terminate(&self, error: Option<BackendError>) {
        self.lock_state().terminate_failure = error;
    }

    pub fn fail_tagging(&self, error: Option<BackendError>) {
        self.lock_state().tag_failure = error;
    }

    pub fn fail_describe(&self, error: Option<BackendError>) {
        self.lock_state().describe_failure = error;
    }

    pub fn on_modify(&self, hook: ModifyHook) {
        *self
            .modify_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn modify_calls(&self) -> usize {
        self.modify_calls.load(Ordering::SeqCst)
    }

    pub fn fleet_terminate_calls(&self) -> usize {
        self.fleet_terminate_calls.load(Ordering::SeqCst)
    }

    pub fn instance_terminate_calls(&self) -> usize {
        self.instance_terminate_calls.load(Ordering::SeqCst)
    }

    /// `(capacity, min, max)` of the most recent successful modify.
    pub fn last_modify(&self) -> Option<(u32, u32, u32)> {
        self.lock_state().last_modify
    }

    pub fn num_desired(&self) -> u32 {
        self.lock_state().num_desired
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.lock_state().instances.keys().cloned().collect()
    }

    pub fn tags_for(&self, instance_id: &str) -> Vec<(String, String)> {
        self.lock_state()
            .tags
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn launch_to_desired(&self, state: &mut SimState) {
        let wanted = match state.launch_limit {
            Some(limit) => limit.min(state.num_desired as usize),
            None => state.num_desired as usize,
        };
        while state.instances.len() < wanted {
            let instance_id = format!("i-{:08x}", state.next_seq);
            state.next_seq += 1;
            debug!(fleet_id = %self.fleet_id, %instance_id, "simulated instance launched");
            state.instances.insert(
                instance_id.clone(),
                InstanceDescription {
                    instance_id,
                    instance_type: self.options.instance_type.clone(),
                    vcpus: self.options.vcpus,
                    memory_mib: self.options.memory_mib,
                    private_ip: Some(format!("10.0.{}.{}", state.next_seq / 250, state.next_seq % 250)),
                },
            );
        }
    }

    fn snapshot(&self) -> Result<Option<FleetStateSnapshot>, BackendError> {
        let state = self.lock_state();
        if let Some(err) = &state.get_state_failure {
            return Err(err.clone());
        }
        if !state.discovered {
            return Ok(None);
        }
        Ok(Some(
            FleetStateSnapshot::new(
                self.fleet_id.clone(),
                state.num_desired,
                state.state,
                state.instances.keys().cloned(),
            )
            .with_weights(self.options.weights.clone()),
        ))
    }

    fn apply_modify(&self, capacity: u32, min: u32, max: u32) -> Result<(), BackendError> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);

        let hook = self
            .modify_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(capacity);
        }

        let mut state = self.lock_state();
        if let Some(err) = &state.modify_failure {
            return Err(err.clone());
        }
        state.num_desired = capacity;
        state.last_modify = Some((capacity, min, max));
        self.launch_to_desired(&mut state);
        Ok(())
    }

    fn apply_terminate(&self, instance_ids: &[InstanceId]) -> Result<(), BackendError> {
        let mut state = self.lock_state();
        if let Some(err) = &state.terminate_failure {
            return Err(err.clone());
        }
        for id in instance_ids {
            state.instances.remove(id);
            state.tags.remove(id);
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FleetBackend for SimulatedFleet {
    fn get_state<'a>(
        &'a self,
        _target: &'a FleetTarget,
    ) -> BackendFuture<'a, Option<FleetStateSnapshot>> {
        let result = self.snapshot();
        Box::pin(async move { result })
    }

    fn modify<'a>(
        &'a self,
        _target: &'a FleetTarget,
        capacity: u32,
        min: u32,
        max: u32,
    ) -> BackendFuture<'a, ()> {
        let result = self.apply_modify(capacity, min, max);
        Box::pin(async move { result })
    }

    fn terminate_instances<'a>(
        &'a self,
        _target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, ()> {
        self.fleet_terminate_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.apply_terminate(instance_ids);
        Box::pin(async move { result })
    }

    fn is_auto_scaling_group(&self) -> bool {
        self.options.auto_scaling_group
    }
}

impl InstanceApi for SimulatedFleet {
    fn terminate_instances<'a>(
        &'a self,
        _target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, ()> {
        self.instance_terminate_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.apply_terminate(instance_ids);
        Box::pin(async move { result })
    }

    fn tag_instances<'a>(
        &'a self,
        _target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
        tags: &'a [(String, String)],
    ) -> BackendFuture<'a, ()> {
        let result = {
            let mut state = self.lock_state();
            match &state.tag_failure {
                Some(err) => Err(err.clone()),
                None => {
                    for id in instance_ids {
                        state
                            .tags
                            .entry(id.clone())
                            .or_default()
                            .extend(tags.iter().cloned());
                    }
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn describe_instances<'a>(
        &'a self,
        _target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, Vec<InstanceDescription>> {
        let result = {
            let state = self.lock_state();
            match &state.describe_failure {
                Some(err) => Err(err.clone()),
                None => Ok(instance_ids
                    .iter()
                    .filter_map(|id| state.instances.get(id).cloned())
                    .collect()),
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> FleetTarget {
        FleetTarget {
            region: "us-east-1".to_string(),
            fleet_id: "sfr-1".to_string(),
            ..Default::default()
        }
    }

    fn fleet(initial: u32) -> SimulatedFleet {
        SimulatedFleet::new(
            "sfr-1",
            SimulatedFleetOptions {
                initial_capacity: initial,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn initial_capacity_is_launched() {
        let fleet = fleet(3);
        let snap = fleet.get_state(&target()).await.unwrap().unwrap();
        assert_eq!(snap.num_desired, 3);
        assert_eq!(snap.instance_ids.len(), 3);
        assert_eq!(snap.state, FleetState::Active);
    }

    #[tokio::test]
    async fn modify_grows_but_does_not_shrink() {
        let fleet = fleet(2);
        fleet.modify(&target(), 4, 0, 10).await.unwrap();
        assert_eq!(fleet.instance_ids().len(), 4);

        fleet.modify(&target(), 1, 0, 10).await.unwrap();
        assert_eq!(fleet.num_desired(), 1);
        assert_eq!(fleet.instance_ids().len(), 4);
        assert_eq!(fleet.last_modify(), Some((1, 0, 10)));
        assert_eq!(fleet.modify_calls(), 2);
    }

    #[tokio::test]
    async fn terminate_paths_are_counted_separately() {
        let fleet = fleet(3);
        let ids = fleet.instance_ids();

        FleetBackend::terminate_instances(&fleet, &target(), &ids[..1])
            .await
            .unwrap();
        InstanceApi::terminate_instances(&fleet, &target(), &ids[1..2])
            .await
            .unwrap();

        assert_eq!(fleet.fleet_terminate_calls(), 1);
        assert_eq!(fleet.instance_terminate_calls(), 1);
        assert_eq!(fleet.instance_ids(), ids[2..].to_vec());
    }

    #[tokio::test]
    async fn launch_limit_holds_back_capacity() {
        let fleet = fleet(1);
        fleet.set_launch_limit(Some(2));
        fleet.modify(&target(), 5, 0, 10).await.unwrap();
        assert_eq!(fleet.num_desired(), 5);
        assert_eq!(fleet.instance_ids().len(), 2);

        fleet.set_launch_limit(None);
        assert_eq!(fleet.instance_ids().len(), 5);
    }

    #[tokio::test]
    async fn undiscovered_fleet_reports_none() {
        let fleet = fleet(0);
        fleet.set_discovered(false);
        assert!(fleet.get_state(&target()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let fleet = fleet(1);
        fleet.fail_modify(Some(BackendError::Throttled("slow down".to_string())));
        let err = fleet.modify(&target(), 5, 0, 10).await.unwrap_err();
        assert_eq!(err, BackendError::Throttled("slow down".to_string()));
        assert_eq!(fleet.num_desired(), 1);

        fleet.fail_modify(None);
        fleet.modify(&target(), 5, 0, 10).await.unwrap();
        assert_eq!(fleet.num_desired(), 5);
    }

    #[tokio::test]
    async fn tags_and_descriptions() {
        let fleet = fleet(1);
        let ids = fleet.instance_ids();
        let tags = vec![("fleetscale:fleet".to_string(), "sfr-1".to_string())];
        fleet.tag_instances(&target(), &ids, &tags).await.unwrap();
        assert_eq!(fleet.tags_for(&ids[0]), tags);

        let described = fleet.describe_instances(&target(), &ids).await.unwrap();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].instance_type, "m5.large");
        assert_eq!(described[0].vcpus, 2);
    }

    #[test]
    fn options_from_section() {
        let section = SimulatedSection {
            instance_type: Some("c5.xlarge".to_string()),
            vcpus: Some(4),
            auto_scaling_group: Some(true),
            ..Default::default()
        };
        let options = SimulatedFleetOptions::from(&section);
        assert_eq!(options.instance_type, "c5.xlarge");
        assert_eq!(options.vcpus, 4);
        assert_eq!(options.memory_mib, 8192);
        assert!(options.auto_scaling_group);
    }
}
