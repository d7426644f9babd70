//! Fleet engine: the capacity reconciliation loop.
//!
//! External schedulers call [`FleetEngine::provision`] and
//! [`FleetEngine::schedule_to_terminate`] from any thread at any time; both
//! only touch the demand accumulator and the planned-unit cache and never
//! wait on remote I/O. [`FleetEngine::update`] runs one reconciliation tick
//! against the remote fleet. Ticks are serialized by an async mutex, and no
//! synchronous lock is held across a backend call, so demand signals (even
//! ones triggered from inside a backend call) can land mid-tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetscale_state::{
    FleetStateSnapshot, FleetTarget, InstanceDescription, InstanceId, TerminationReason,
    WorkerNode,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::accumulator::{DemandAccumulator, PendingTermination};
use crate::backend::{FleetBackend, InstanceApi};
use crate::error::{EngineError, EngineResult};
use crate::planned::{PlannedUnit, PlannedUnitCache};
use crate::policy::ExecutorScaling;
use crate::registry::NodeRegistry;
use crate::scaling::ScalingConfig;

/// Tag key written on every instance the engine materializes.
pub const FLEET_TAG_KEY: &str = "fleetscale:fleet-id";

/// Operator-facing view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub fleet_id: String,
    pub snapshot: Option<FleetStateSnapshot>,
    pub pending_add: u32,
    pub pending_terminations: BTreeMap<InstanceId, TerminationReason>,
    pub planned_units: usize,
    pub min_size: u32,
    pub max_size: u32,
    /// Error of the most recent failed tick; cleared by a successful one.
    pub last_error: Option<String>,
    /// Unix timestamp of the last successful tick.
    pub last_update: Option<u64>,
}

pub struct FleetEngine {
    target: FleetTarget,
    config: ScalingConfig,
    policy: ExecutorScaling,
    backend: Arc<dyn FleetBackend>,
    instances: Arc<dyn InstanceApi>,
    registry: Arc<dyn NodeRegistry>,
    accumulator: DemandAccumulator,
    planned: PlannedUnitCache,
    /// Last published snapshot.
    snapshot: RwLock<Option<Arc<FleetStateSnapshot>>>,
    last_error: RwLock<Option<String>>,
    last_update: AtomicU64,
    /// Serializes ticks.
    tick_lock: Mutex<()>,
}

impl FleetEngine {
    pub fn new(
        target: FleetTarget,
        config: ScalingConfig,
        backend: Arc<dyn FleetBackend>,
        instances: Arc<dyn InstanceApi>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        let policy = config.effective_policy();
        let planned = PlannedUnitCache::new(config.planned_unit_timeout);
        Self {
            target,
            config,
            policy,
            backend,
            instances,
            registry,
            accumulator: DemandAccumulator::new(),
            planned,
            snapshot: RwLock::new(None),
            last_error: RwLock::new(None),
            last_update: AtomicU64::new(0),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &FleetTarget {
        &self.target
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    // ── Demand signals ──────────────────────────────────────────────

    /// Whether this fleet may take demand for `label`.
    ///
    /// A fleet without an id never provisions. Otherwise the label must
    /// match one of the fleet's labels, and unlabeled demand is refused
    /// when usage is restricted.
    pub fn can_provision(&self, label: Option<&str>) -> bool {
        if self.target.fleet_id.is_empty() {
            return false;
        }
        let allowed = self.config.serves_label(label);
        if !allowed {
            debug!(fleet_id = %self.target.fleet_id, ?label, "fleet does not serve label");
        }
        allowed
    }

    /// Request capacity for `excess_workload` executors.
    ///
    /// Returns one planned unit per accepted unit; fewer (possibly none) when
    /// the fleet is near `max_size` or has not been discovered yet.
    pub fn provision(&self, excess_workload: u32) -> Vec<PlannedUnit> {
        if excess_workload == 0 {
            return Vec::new();
        }
        if self.accumulator.desired().is_none() {
            debug!(fleet_id = %self.target.fleet_id, "fleet not discovered yet, ignoring provision request");
            return Vec::new();
        }

        let per_unit = self.config.num_executors_per_unit.max(1);
        let wanted = excess_workload.div_ceil(per_unit);
        let accepted = self
            .accumulator
            .request_scale_up(wanted, self.config.max_size);

        if accepted == 0 {
            debug!(
                fleet_id = %self.target.fleet_id,
                wanted,
                max_size = self.config.max_size,
                "fleet at max size, provision request capped"
            );
            return Vec::new();
        }

        info!(
            fleet_id = %self.target.fleet_id,
            excess_workload,
            wanted,
            accepted,
            pending_add = self.accumulator.pending_add(),
            "provisioning units"
        );
        self.planned.add_planned(accepted, per_unit, Instant::now())
    }

    /// Queue an instance for termination at the next tick.
    ///
    /// Without `force` the request must keep the fleet at or above
    /// `min_size` and keep at least `min_spare_size` other idle computers.
    pub fn schedule_to_terminate(
        &self,
        instance_id: &str,
        force: bool,
        reason: TerminationReason,
    ) -> bool {
        let Some(desired) = self.accumulator.desired() else {
            debug!(%instance_id, "fleet not discovered yet, ignoring termination request");
            return false;
        };

        let min_size = self.config.min_size as usize;
        let min_spare = self.config.min_spare_size as usize;
        let computers = if !force && min_spare > 0 {
            self.registry.list_computers()
        } else {
            Vec::new()
        };

        let accepted = self.accumulator.try_schedule_termination(
            instance_id,
            PendingTermination::new(reason, force),
            |queued| {
                if force {
                    return true;
                }
                let remaining = (desired as usize).saturating_sub(queued.len());
                if remaining <= min_size {
                    debug!(%instance_id, remaining, min_size, "termination would breach min size");
                    return false;
                }
                if min_spare > 0 {
                    let spare = computers
                        .iter()
                        .filter(|c| {
                            c.fleet_id == self.target.fleet_id
                                && c.instance_id != instance_id
                                && c.is_idle()
                                && !queued.contains_key(&c.instance_id)
                        })
                        .count();
                    if spare < min_spare {
                        debug!(%instance_id, spare, min_spare, "termination would breach min spare size");
                        return false;
                    }
                }
                true
            },
        );

        if accepted {
            info!(
                fleet_id = %self.target.fleet_id,
                %instance_id,
                %reason,
                force,
                "instance scheduled for termination"
            );
        }
        accepted
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Run one reconciliation tick.
    ///
    /// Returns the snapshot published by this tick, or the previous one when
    /// the fleet is undiscovered or not `Active`. A failed resize returns an
    /// error and leaves pending demand in place. A failed terminate call
    /// after a successful resize still materializes new members and
    /// publishes the snapshot before the error is returned.
    pub async fn update(&self) -> EngineResult<Option<Arc<FleetStateSnapshot>>> {
        let _tick = self.tick_lock.lock().await;

        let expired = self.planned.expire(Instant::now());
        if expired > 0 {
            debug!(fleet_id = %self.target.fleet_id, expired, "planned units timed out");
        }

        let fresh = match self.backend.get_state(&self.target).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(fleet_id = %self.target.fleet_id, "fleet not discovered yet, skipping tick");
                return Ok(self.snapshot());
            }
            Err(source) => {
                let err = EngineError::ReadState(source);
                warn!(fleet_id = %self.target.fleet_id, error = %err, "failed to read fleet state");
                self.record_error(&err);
                return Err(err);
            }
        };

        if !fresh.is_active() {
            debug!(
                fleet_id = %self.target.fleet_id,
                state = %fresh.state,
                "fleet not active, skipping tick"
            );
            return Ok(self.snapshot());
        }
        self.accumulator.observe_desired(fresh.num_desired);

        let (to_terminate, already_counted, vanished) = self.select_terminations(&fresh);
        if !vanished.is_empty() {
            debug!(count = vanished.len(), "dropping terminations for instances no longer in fleet");
            self.accumulator.remove_terminations(&vanished);
        }

        let pending_add = self.accumulator.pending_add();
        let base = fresh.num_desired as i64 - (to_terminate.len() - already_counted) as i64;
        let mut wanted = base + pending_add as i64;
        let shortfall = self.spare_shortfall(&fresh, &to_terminate, wanted);
        if shortfall > 0 {
            debug!(
                fleet_id = %self.target.fleet_id,
                shortfall,
                min_spare = self.config.min_spare_size,
                "raising target to keep spare capacity"
            );
            wanted += shortfall;
        }
        let new_target = self.config.clamp_target(wanted);
        let applied_add = (new_target as i64 - base).clamp(0, pending_add as i64) as u32;

        let mut terminated: &[InstanceId] = &[];
        let mut terminate_error = None;
        if new_target != fresh.num_desired || !to_terminate.is_empty() {
            info!(
                fleet_id = %self.target.fleet_id,
                from = fresh.num_desired,
                to = new_target,
                add = applied_add,
                terminate = to_terminate.len(),
                "resizing fleet"
            );

            if let Err(source) = self
                .backend
                .modify(
                    &self.target,
                    new_target,
                    self.config.min_size,
                    self.config.max_size,
                )
                .await
            {
                let err = EngineError::Modify {
                    target: new_target,
                    source,
                };
                warn!(fleet_id = %self.target.fleet_id, error = %err, "fleet resize failed, pending demand kept for retry");
                self.record_error(&err);
                return Err(err);
            }
            self.accumulator.commit_add(applied_add, new_target);

            if !to_terminate.is_empty() {
                match self.terminate(&to_terminate).await {
                    Ok(()) => terminated = &to_terminate,
                    // The resize stuck; finish the tick so new members still
                    // become nodes, then report the failure.
                    Err(err) => terminate_error = Some(err),
                }
            }
        }

        let new_ids: Vec<InstanceId> = fresh
            .instance_ids
            .iter()
            .filter(|id| !to_terminate.contains(*id) && self.registry.get_computer(id).is_none())
            .cloned()
            .collect();
        if !new_ids.is_empty() {
            self.materialize(&fresh, &new_ids).await;
        }
        self.remove_departed(&fresh);

        let trimmed = self.planned.trim_to(new_target as usize);
        if trimmed > 0 {
            debug!(fleet_id = %self.target.fleet_id, trimmed, target = new_target, "cancelled excess planned units");
        }

        let mut published = fresh.with_num_desired(new_target);
        for id in terminated {
            published.instance_ids.remove(id);
        }
        let published = Arc::new(published);
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(published.clone());

        if let Some(err) = terminate_error {
            return Err(err);
        }
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.last_update.store(epoch_secs(), Ordering::Release);

        Ok(Some(published))
    }

    /// Units missing to keep `min_spare_size` idle computers once the fleet
    /// reaches `wanted`.
    ///
    /// Spare capacity is every member not terminated this tick whose
    /// computer is idle or not registered yet, plus every unit the target
    /// adds beyond the members that remain.
    fn spare_shortfall(
        &self,
        fresh: &FleetStateSnapshot,
        to_terminate: &[InstanceId],
        wanted: i64,
    ) -> i64 {
        let min_spare = self.config.min_spare_size as i64;
        if min_spare == 0 {
            return 0;
        }
        let idle = fresh
            .instance_ids
            .iter()
            .filter(|id| !to_terminate.contains(*id))
            .filter(|id| {
                self.registry
                    .get_computer(id)
                    .is_none_or(|computer| computer.is_idle())
            })
            .count() as i64;
        let remaining = (fresh.instance_ids.len() - to_terminate.len()) as i64;
        let launching = (wanted - remaining).max(0);
        (min_spare - idle - launching).max(0)
    }

    /// Split queued terminations into those to issue now and those whose
    /// instance already left the fleet. Busy computers stay queued, forced
    /// or not.
    ///
    /// The middle value counts selected instances the fleet target was
    /// already lowered for by an earlier, partially failed tick.
    fn select_terminations(
        &self,
        fresh: &FleetStateSnapshot,
    ) -> (Vec<InstanceId>, usize, Vec<InstanceId>) {
        let mut to_terminate = Vec::new();
        let mut already_counted = 0;
        let mut vanished = Vec::new();

        for (id, pending) in self.accumulator.pending_terminations() {
            if !fresh.contains(&id) {
                vanished.push(id);
                continue;
            }
            // Not yet registered counts as idle.
            let busy = self
                .registry
                .get_computer(&id)
                .is_some_and(|computer| !computer.is_idle());
            if busy {
                debug!(instance_id = %id, "instance busy, termination deferred");
                continue;
            }
            if pending.target_adjusted {
                already_counted += 1;
            }
            to_terminate.push(id);
        }

        to_terminate.sort();
        (to_terminate, already_counted, vanished)
    }

    async fn terminate(&self, instance_ids: &[InstanceId]) -> EngineResult<()> {
        let result = if self.backend.is_auto_scaling_group() {
            self.backend
                .terminate_instances(&self.target, instance_ids)
                .await
        } else {
            self.instances
                .terminate_instances(&self.target, instance_ids)
                .await
        };

        match result {
            Ok(()) => {
                self.accumulator.remove_terminations(instance_ids);
                for id in instance_ids {
                    self.registry.remove_node(id);
                }
                info!(
                    fleet_id = %self.target.fleet_id,
                    count = instance_ids.len(),
                    instances = ?instance_ids,
                    "instances terminated"
                );
                Ok(())
            }
            Err(source) => {
                let err = EngineError::Terminate {
                    count: instance_ids.len(),
                    source,
                };
                warn!(fleet_id = %self.target.fleet_id, error = %err, "terminate failed, instances stay queued");
                self.accumulator.mark_target_adjusted(instance_ids);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Create worker nodes for instances the registry has not seen yet.
    async fn materialize(&self, snapshot: &FleetStateSnapshot, new_ids: &[InstanceId]) -> usize {
        let tags = [(FLEET_TAG_KEY.to_string(), self.target.fleet_id.clone())];
        if let Err(e) = self
            .instances
            .tag_instances(&self.target, new_ids, &tags)
            .await
        {
            warn!(fleet_id = %self.target.fleet_id, count = new_ids.len(), error = %e, "failed to tag new instances");
        }

        let descriptions: HashMap<InstanceId, InstanceDescription> = match self
            .instances
            .describe_instances(&self.target, new_ids)
            .await
        {
            Ok(list) => list
                .into_iter()
                .map(|d| (d.instance_id.clone(), d))
                .collect(),
            Err(e) => {
                warn!(fleet_id = %self.target.fleet_id, error = %e, "failed to describe new instances, using flat executor count");
                HashMap::new()
            }
        };

        let now = epoch_secs();
        let mut added = 0;
        for id in new_ids {
            let description = descriptions.get(id);
            let num_executors = self.policy.executors_for(
                self.config.num_executors_per_unit,
                description,
                &snapshot.instance_type_weights,
            );
            let node = WorkerNode {
                name: id.clone(),
                instance_id: id.clone(),
                fleet_id: self.target.fleet_id.clone(),
                num_executors,
                labels: self.config.labels.clone(),
                instance_type: description.map(|d| d.instance_type.clone()),
                private_ip: description.and_then(|d| d.private_ip.clone()),
                max_total_uses: self.config.max_total_uses,
                created_at: now,
            };

            if let Err(e) = self.registry.add_node(node.clone()) {
                warn!(instance_id = %id, error = %e, "failed to register node");
                continue;
            }
            info!(fleet_id = %self.target.fleet_id, instance_id = %id, num_executors, "worker node created");
            self.planned.fulfill_next(node);
            added += 1;
        }
        added
    }

    /// Drop registry nodes whose instance is no longer a fleet member.
    fn remove_departed(&self, fresh: &FleetStateSnapshot) {
        for computer in self.registry.list_computers() {
            if computer.fleet_id == self.target.fleet_id
                && !fresh.contains(&computer.instance_id)
                && self.registry.remove_node(&computer.instance_id)
            {
                info!(instance_id = %computer.instance_id, "removed node for departed instance");
            }
        }
    }

    fn record_error(&self, err: &EngineError) {
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Option<Arc<FleetStateSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending_add(&self) -> u32 {
        self.accumulator.pending_add()
    }

    pub fn instances_pending_termination(&self) -> BTreeMap<InstanceId, TerminationReason> {
        self.accumulator
            .pending_terminations()
            .into_iter()
            .map(|(id, pending)| (id, pending.reason))
            .collect()
    }

    pub fn planned_units(&self) -> usize {
        self.planned.len()
    }

    /// Cancel planned units whose deadline passed.
    pub fn expire_planned(&self) -> usize {
        self.planned.expire(Instant::now())
    }

    pub fn status(&self) -> FleetStatus {
        let last_update = self.last_update.load(Ordering::Acquire);
        FleetStatus {
            fleet_id: self.target.fleet_id.clone(),
            snapshot: self.snapshot().map(|s| (*s).clone()),
            pending_add: self.pending_add(),
            pending_terminations: self.instances_pending_termination(),
            planned_units: self.planned_units(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            last_error: self
                .last_error
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            last_update: (last_update > 0).then_some(last_update),
        }
    }

    /// Cancel all outstanding planned units.
    pub fn shutdown(&self) -> usize {
        self.planned.cancel_all()
    }

    /// Run the reconciliation loop until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            fleet_id = %self.target.fleet_id,
            interval_secs = interval.as_secs(),
            "fleet engine started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.planned.next_deadline();
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        error!(fleet_id = %self.target.fleet_id, error = %e, "fleet update failed");
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    let expired = self.expire_planned();
                    debug!(expired, "planned unit deadline reached");
                }
                _ = shutdown.changed() => {
                    info!(fleet_id = %self.target.fleet_id, "fleet engine shutting down");
                    break;
                }
            }
        }

        let cancelled = self.shutdown();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding planned units");
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
