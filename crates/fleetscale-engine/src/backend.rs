//! Remote fleet capabilities consumed by the engine.
//!
//! Concrete backends (spot fleet, auto-scaling group, ...) implement
//! [`FleetBackend`]; the generic per-instance API used for tagging,
//! describing and non-ASG termination is [`InstanceApi`]. Both return boxed
//! futures so they can be used as trait objects.

use std::future::Future;
use std::pin::Pin;

use fleetscale_state::{FleetStateSnapshot, FleetTarget, InstanceDescription, InstanceId};

use crate::error::BackendError;

/// Boxed future alias for backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Uniform interface over the remote fleet implementation.
pub trait FleetBackend: Send + Sync {
    /// Read the current fleet state. `None` means the fleet has not been
    /// discovered yet.
    fn get_state<'a>(
        &'a self,
        target: &'a FleetTarget,
    ) -> BackendFuture<'a, Option<FleetStateSnapshot>>;

    /// Set the fleet's target capacity and size bounds.
    fn modify<'a>(
        &'a self,
        target: &'a FleetTarget,
        capacity: u32,
        min: u32,
        max: u32,
    ) -> BackendFuture<'a, ()>;

    /// Terminate instances through the fleet's own API (auto-scaling groups).
    fn terminate_instances<'a>(
        &'a self,
        target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, ()>;

    fn is_auto_scaling_group(&self) -> bool;
}

/// Generic compute-instance API.
pub trait InstanceApi: Send + Sync {
    fn terminate_instances<'a>(
        &'a self,
        target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, ()>;

    fn tag_instances<'a>(
        &'a self,
        target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
        tags: &'a [(String, String)],
    ) -> BackendFuture<'a, ()>;

    fn describe_instances<'a>(
        &'a self,
        target: &'a FleetTarget,
        instance_ids: &'a [InstanceId],
    ) -> BackendFuture<'a, Vec<InstanceDescription>>;
}
