//! fleetscale-engine: capacity reconciliation for one elastic fleet.
//!
//! Accumulates asynchronous demand signals (scale-up requests and
//! per-instance termination requests), reconciles them against the remote
//! fleet on every tick, and turns newly observed instances into worker nodes.
//!
//! # Tick Algorithm
//!
//! ```text
//! snapshot = backend.get_state()
//! if snapshot is None or snapshot.state != Active:
//!     return last published snapshot            // busy, do not interfere
//!
//! terminate  = queued terminations whose computer is idle, unregistered, or forced
//! base       = snapshot.num_desired - len(terminate not yet counted in the target)
//! new_target = clamp(base + pending_add, min_size, max_size)
//!
//! if new_target != snapshot.num_desired or terminate not empty:
//!     backend.modify(new_target, min_size, max_size)     // error: keep all demand
//!     pending_add -= applied portion
//!     terminate via ASG or instance API, dequeue them
//!
//! for id in members unknown to the registry:
//!     tag (best effort), size via policy, register node, fulfil a planned unit
//!
//! planned.trim_to(new_target)
//! publish snapshot
//! ```

pub mod accumulator;
pub mod backend;
pub mod engine;
pub mod error;
pub mod planned;
pub mod policy;
pub mod registry;
pub mod retention;
pub mod scaling;
pub mod simulated;

pub use accumulator::{DemandAccumulator, PendingTermination};
pub use backend::{BackendFuture, FleetBackend, InstanceApi};
pub use engine::{FleetEngine, FleetStatus, FLEET_TAG_KEY};
pub use error::{BackendError, EngineError, EngineResult, RegistryError};
pub use planned::{PlanCancelled, PlanOutcome, PlannedUnit, PlannedUnitCache};
pub use policy::ExecutorScaling;
pub use registry::{InMemoryRegistry, NodeRegistry};
pub use retention::{IdleRetention, RetentionReport};
pub use scaling::ScalingConfig;
pub use simulated::{SimulatedFleet, SimulatedFleetOptions};
