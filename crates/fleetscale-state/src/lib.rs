//! fleetscale-state: domain types shared across the fleetscale crates.
//!
//! A [`FleetStateSnapshot`] is the last known remote view of one managed
//! fleet: its target capacity, its lifecycle state, and which instances
//! currently belong to it. Snapshots are immutable and replaced wholesale on
//! every reconciliation tick.
//!
//! All types are serializable to/from JSON so the API layer can expose them
//! directly.

pub mod types;

pub use types::*;
