//! Demand accumulator for pending scale-up units and pending terminations.
//!
//! Callers on arbitrary threads add demand between reconciliation ticks; a
//! tick reads the accumulated delta and subtracts only what it applied, so
//! demand added while a tick is in flight survives into the next one.
//!
//! The accumulator also tracks the fleet's committed target capacity. The
//! target and the pending-add count change together under one short
//! critical section, so a scale-up request can never be sized against a
//! target that a concurrent tick has already moved past. Neither lock is
//! ever held across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleetscale_state::{InstanceId, TerminationReason};

/// A queued termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTermination {
    pub reason: TerminationReason,
    /// Bypass the `min_size` / `min_spare_size` admission bounds. A busy
    /// computer is still never terminated.
    pub force: bool,
    /// The fleet target already dropped by one for this instance, but the
    /// terminate call itself failed.
    pub target_adjusted: bool,
}

impl PendingTermination {
    pub fn new(reason: TerminationReason, force: bool) -> Self {
        Self {
            reason,
            force,
            target_adjusted: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Capacity {
    /// Target capacity last committed; `None` until the fleet is discovered.
    desired: Option<u32>,
    /// Units requested but not yet folded into a resize call.
    pending_add: u32,
}

#[derive(Debug, Default)]
pub struct DemandAccumulator {
    capacity: Mutex<Capacity>,
    terminations: Mutex<HashMap<InstanceId, PendingTermination>>,
}

impl DemandAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add up to `count` units without letting `desired + pending` exceed
    /// `max_size`. Returns the number of units accepted; zero while the
    /// fleet has not been discovered.
    pub fn request_scale_up(&self, count: u32, max_size: u32) -> u32 {
        let mut capacity = self.lock_capacity();
        let Some(desired) = capacity.desired else {
            return 0;
        };
        let headroom = max_size.saturating_sub(desired.saturating_add(capacity.pending_add));
        let accepted = count.min(headroom);
        capacity.pending_add += accepted;
        accepted
    }

    pub fn pending_add(&self) -> u32 {
        self.lock_capacity().pending_add
    }

    pub fn desired(&self) -> Option<u32> {
        self.lock_capacity().desired
    }

    /// Record the target capacity read from the remote fleet.
    pub fn observe_desired(&self, desired: u32) {
        self.lock_capacity().desired = Some(desired);
    }

    /// Commit a successful resize: subtract the applied portion of pending
    /// demand and move the target in the same step.
    pub fn commit_add(&self, applied: u32, new_desired: u32) {
        let mut capacity = self.lock_capacity();
        capacity.pending_add = capacity.pending_add.saturating_sub(applied);
        capacity.desired = Some(new_desired);
    }

    /// Queue `instance_id` for termination.
    ///
    /// Rejected if the id is already queued or if `admit` (which sees the
    /// current queue under the lock) refuses it.
    pub fn try_schedule_termination<F>(
        &self,
        instance_id: &str,
        pending: PendingTermination,
        admit: F,
    ) -> bool
    where
        F: FnOnce(&HashMap<InstanceId, PendingTermination>) -> bool,
    {
        let mut terminations = self.lock_terminations();
        if terminations.contains_key(instance_id) {
            return false;
        }
        if !admit(&terminations) {
            return false;
        }
        terminations.insert(instance_id.to_string(), pending);
        true
    }

    pub fn pending_terminations(&self) -> HashMap<InstanceId, PendingTermination> {
        self.lock_terminations().clone()
    }

    pub fn pending_termination_count(&self) -> usize {
        self.lock_terminations().len()
    }

    /// Flag queued terminations whose resize went through but whose
    /// terminate call did not, so the next tick does not lower the target
    /// for them a second time.
    pub fn mark_target_adjusted(&self, instance_ids: &[InstanceId]) {
        let mut terminations = self.lock_terminations();
        for id in instance_ids {
            if let Some(pending) = terminations.get_mut(id) {
                pending.target_adjusted = true;
            }
        }
    }

    /// Dequeue terminations, either issued by a tick or for instances that
    /// already left the fleet.
    pub fn remove_terminations(&self, instance_ids: &[InstanceId]) {
        if instance_ids.is_empty() {
            return;
        }
        let mut terminations = self.lock_terminations();
        for id in instance_ids {
            terminations.remove(id);
        }
    }

    fn lock_capacity(&self) -> MutexGuard<'_, Capacity> {
        self.capacity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_terminations(&self) -> MutexGuard<'_, HashMap<InstanceId, PendingTermination>> {
        self.terminations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn idle() -> PendingTermination {
        PendingTermination::new(TerminationReason::IdleTooLong, false)
    }

    fn discovered(desired: u32) -> DemandAccumulator {
        let acc = DemandAccumulator::new();
        acc.observe_desired(desired);
        acc
    }

    #[test]
    fn undiscovered_fleet_accepts_nothing() {
        let acc = DemandAccumulator::new();
        assert_eq!(acc.request_scale_up(3, 10), 0);
        assert_eq!(acc.pending_add(), 0);
        assert_eq!(acc.desired(), None);
    }

    #[test]
    fn scale_up_caps_at_max() {
        let acc = discovered(5);
        assert_eq!(acc.request_scale_up(10, 10), 5);
        assert_eq!(acc.pending_add(), 5);
        // Already at max.
        assert_eq!(acc.request_scale_up(1, 10), 0);
        assert_eq!(acc.pending_add(), 5);
    }

    #[test]
    fn scale_up_accumulates() {
        let acc = discovered(0);
        assert_eq!(acc.request_scale_up(2, 10), 2);
        assert_eq!(acc.request_scale_up(3, 10), 3);
        assert_eq!(acc.pending_add(), 5);
    }

    #[test]
    fn scale_up_when_desired_exceeds_max() {
        let acc = discovered(12);
        assert_eq!(acc.request_scale_up(3, 10), 0);
        assert_eq!(acc.pending_add(), 0);
    }

    #[test]
    fn commit_subtracts_only_applied() {
        let acc = discovered(0);
        acc.request_scale_up(4, 10);
        acc.commit_add(3, 3);
        assert_eq!(acc.pending_add(), 1);
        assert_eq!(acc.desired(), Some(3));
        acc.commit_add(5, 4);
        assert_eq!(acc.pending_add(), 0);
    }

    #[test]
    fn commit_keeps_headroom_consistent() {
        let acc = discovered(2);
        assert_eq!(acc.request_scale_up(3, 6), 3);
        acc.commit_add(3, 5);
        // 5 desired + 0 pending leaves room for exactly one more.
        assert_eq!(acc.request_scale_up(4, 6), 1);
    }

    #[test]
    fn concurrent_scale_up_never_exceeds_max() {
        let acc = Arc::new(discovered(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    let mut total = 0;
                    for _ in 0..100 {
                        total += acc.request_scale_up(1, 50);
                    }
                    total
                })
            })
            .collect();
        let accepted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 47);
        assert_eq!(acc.pending_add(), 47);
    }

    #[test]
    fn duplicate_termination_rejected() {
        let acc = DemandAccumulator::new();
        assert!(acc.try_schedule_termination("i-1", idle(), |_| true));
        assert!(!acc.try_schedule_termination("i-1", idle(), |_| true));
        assert_eq!(acc.pending_termination_count(), 1);
    }

    #[test]
    fn admit_sees_current_queue() {
        let acc = DemandAccumulator::new();
        assert!(acc.try_schedule_termination("i-1", idle(), |q| q.is_empty()));
        assert!(!acc.try_schedule_termination("i-2", idle(), |q| q.is_empty()));
        assert_eq!(acc.pending_termination_count(), 1);
    }

    #[test]
    fn mark_target_adjusted_flags_only_queued() {
        let acc = DemandAccumulator::new();
        acc.try_schedule_termination("i-1", idle(), |_| true);
        acc.mark_target_adjusted(&["i-1".to_string(), "i-2".to_string()]);

        let pending = acc.pending_terminations();
        assert!(pending["i-1"].target_adjusted);
        assert!(!pending.contains_key("i-2"));
    }

    #[test]
    fn remove_terminations_drops_entries() {
        let acc = DemandAccumulator::new();
        acc.try_schedule_termination("i-1", idle(), |_| true);
        acc.try_schedule_termination("i-2", idle(), |_| true);
        acc.try_schedule_termination("i-3", idle(), |_| true);

        acc.remove_terminations(&["i-1".to_string(), "i-3".to_string()]);

        let pending = acc.pending_terminations();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key("i-2"));
    }
}
