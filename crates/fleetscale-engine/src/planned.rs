//! Planned-unit cache: in-flight provisioning promises.
//!
//! Every accepted scale-up unit hands the caller a [`PlannedUnit`], a
//! oneshot promise that settles with the [`WorkerNode`] once the backing
//! instance shows up, or with a [`PlanCancelled`] reason otherwise.
//!
//! Each record carries an optional deadline instead of a runtime timer; the
//! engine sweeps expired records with [`PlannedUnitCache::expire`]. Settling
//! removes the record, so its deadline disappears with it. Sending on a
//! oneshot whose receiver is gone is ignored, which makes every cancellation
//! path idempotent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetscale_state::WorkerNode;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;

/// Why a planned unit did not turn into a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlanCancelled {
    #[error("fleet target capacity dropped below the planned units")]
    Trimmed,

    #[error("planned unit was not fulfilled before its deadline")]
    TimedOut,

    #[error("engine shut down")]
    Shutdown,

    #[error("planned unit was dropped without settling")]
    Abandoned,
}

pub type PlanOutcome = Result<WorkerNode, PlanCancelled>;

/// A promise for one unit whose instance does not exist yet.
#[derive(Debug)]
pub struct PlannedUnit {
    id: u64,
    num_executors: u32,
    receiver: oneshot::Receiver<PlanOutcome>,
}

impl PlannedUnit {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Executors this unit is expected to provide.
    pub fn num_executors(&self) -> u32 {
        self.num_executors
    }

    /// Wait until the unit is fulfilled or cancelled.
    pub async fn wait(self) -> PlanOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PlanCancelled::Abandoned),
        }
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_outcome(&mut self) -> Option<PlanOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(PlanCancelled::Abandoned)),
        }
    }
}

struct PlannedRecord {
    sender: oneshot::Sender<PlanOutcome>,
    deadline: Option<Instant>,
}

impl PlannedRecord {
    fn cancel(self, reason: PlanCancelled) {
        let _ = self.sender.send(Err(reason));
    }
}

/// FIFO of unsettled planned units, oldest first.
pub struct PlannedUnitCache {
    records: Mutex<VecDeque<PlannedRecord>>,
    /// `None` disables deadlines.
    timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl PlannedUnitCache {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create `count` promises and append them to the cache.
    pub fn add_planned(&self, count: u32, num_executors: u32, now: Instant) -> Vec<PlannedUnit> {
        let deadline = self.timeout.map(|t| now + t);
        let mut units = Vec::with_capacity(count as usize);
        let mut records = self.lock_records();
        for _ in 0..count {
            let (sender, receiver) = oneshot::channel();
            records.push_back(PlannedRecord { sender, deadline });
            units.push(PlannedUnit {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                num_executors,
                receiver,
            });
        }
        units
    }

    /// Settle the oldest live promise with `node`.
    ///
    /// Returns `false` when no live promise was waiting.
    pub fn fulfill_next(&self, node: WorkerNode) -> bool {
        let mut node = node;
        let mut records = self.lock_records();
        while let Some(record) = records.pop_front() {
            if record.sender.is_closed() {
                continue;
            }
            match record.sender.send(Ok(node)) {
                Ok(()) => return true,
                Err(Ok(returned)) => node = returned,
                Err(Err(_)) => return false,
            }
        }
        false
    }

    /// Cancel the oldest promises until at most `target` remain.
    ///
    /// Reads the cache as it is now, including entries appended while the
    /// caller was busy elsewhere. Returns the number cancelled.
    pub fn trim_to(&self, target: usize) -> usize {
        let mut records = self.lock_records();
        records.retain(|r| !r.sender.is_closed());
        let mut cancelled = 0;
        while records.len() > target {
            if let Some(record) = records.pop_front() {
                record.cancel(PlanCancelled::Trimmed);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel every promise whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let mut records = self.lock_records();
        let mut kept = VecDeque::with_capacity(records.len());
        let mut expired = 0;
        for record in records.drain(..) {
            match record.deadline {
                Some(deadline) if deadline <= now => {
                    record.cancel(PlanCancelled::TimedOut);
                    expired += 1;
                }
                _ => kept.push_back(record),
            }
        }
        *records = kept;
        expired
    }

    /// Earliest deadline among pending promises.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock_records().iter().filter_map(|r| r.deadline).min()
    }

    /// Number of live (not abandoned) promises.
    pub fn len(&self) -> usize {
        self.lock_records()
            .iter()
            .filter(|r| !r.sender.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel everything (shutdown).
    pub fn cancel_all(&self) -> usize {
        let mut records = self.lock_records();
        let count = records.len();
        for record in records.drain(..) {
            record.cancel(PlanCancelled::Shutdown);
        }
        count
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<PlannedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
