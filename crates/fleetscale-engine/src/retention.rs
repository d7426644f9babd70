//! Idle retention: recycles computers that sat idle too long or used up
//! their build budget.
//!
//! Exhausted computers are scheduled with `force` so they bypass the size
//! bounds; a busy one stays queued until its build finishes. Idle ones go
//! through the normal bounds and may be refused to keep `min_size` /
//! `min_spare_size`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetscale_state::TerminationReason;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::engine::FleetEngine;
use crate::registry::NodeRegistry;

/// Result of one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub idle_scheduled: usize,
    pub exhausted_scheduled: usize,
}

pub struct IdleRetention {
    engine: Arc<FleetEngine>,
    registry: Arc<dyn NodeRegistry>,
    idle_timeout: Option<Duration>,
}

impl IdleRetention {
    pub fn new(engine: Arc<FleetEngine>, registry: Arc<dyn NodeRegistry>) -> Self {
        let idle_timeout = engine.config().idle_timeout;
        Self {
            engine,
            registry,
            idle_timeout,
        }
    }

    /// Scan this fleet's computers once. `now` is unix seconds.
    pub fn check(&self, now: u64) -> RetentionReport {
        let mut report = RetentionReport::default();
        let fleet_id = &self.engine.target().fleet_id;

        for computer in self.registry.list_computers() {
            if &computer.fleet_id != fleet_id {
                continue;
            }

            if computer.uses_exhausted() {
                if self.engine.schedule_to_terminate(
                    &computer.instance_id,
                    true,
                    TerminationReason::MaxUsesExhausted,
                ) {
                    report.exhausted_scheduled += 1;
                }
                continue;
            }

            let Some(timeout) = self.idle_timeout else {
                continue;
            };
            let Some(idle_since) = computer.idle_since.filter(|_| computer.is_idle()) else {
                continue;
            };
            if now.saturating_sub(idle_since) >= timeout.as_secs()
                && self.engine.schedule_to_terminate(
                    &computer.instance_id,
                    false,
                    TerminationReason::IdleTooLong,
                )
            {
                report.idle_scheduled += 1;
            }
        }

        if report != RetentionReport::default() {
            info!(
                %fleet_id,
                idle = report.idle_scheduled,
                exhausted = report.exhausted_scheduled,
                "retention scheduled terminations"
            );
        }
        report
    }

    /// Run the retention loop until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.map(|t| t.as_secs()),
            "idle retention started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.check(epoch_secs());
                    debug!(?report, "retention pass complete");
                }
                _ = shutdown.changed() => {
                    info!("idle retention shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
