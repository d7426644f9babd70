//! fleetscale-api: REST API for a fleetscale daemon.
//!
//! Exposes the engine's demand signals (provision, terminate, run a tick)
//! and read-only views of the fleet and its worker nodes. The computer
//! lifecycle routes let an external scheduler report when a node picks up
//! or finishes a build.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/fleet` | Fleet status |
//! | POST | `/api/v1/fleet/provision` | Request capacity for excess workload |
//! | POST | `/api/v1/fleet/terminate` | Queue an instance for termination |
//! | POST | `/api/v1/fleet/update` | Run one reconciliation tick now |
//! | GET | `/api/v1/fleet/pending` | Pending demand |
//! | GET | `/api/v1/nodes` | List registered computers |
//! | GET | `/api/v1/nodes/:id` | Get one node |
//! | POST | `/api/v1/nodes/:id/busy` | Computer started a build |
//! | POST | `/api/v1/nodes/:id/idle` | Computer finished a build |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fleetscale_engine::{FleetEngine, InMemoryRegistry};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<FleetEngine>,
    pub registry: Arc<InMemoryRegistry>,
}

/// Build the complete API router.
pub fn build_router(engine: Arc<FleetEngine>, registry: Arc<InMemoryRegistry>) -> Router {
    let state = ApiState { engine, registry };

    let api_routes = Router::new()
        .route("/fleet", get(handlers::fleet_status))
        .route("/fleet/provision", post(handlers::provision))
        .route("/fleet/terminate", post(handlers::terminate))
        .route("/fleet/update", post(handlers::run_update))
        .route("/fleet/pending", get(handlers::pending))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/busy", post(handlers::mark_busy))
        .route("/nodes/{id}/idle", post(handlers::mark_idle))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

pub use handlers::ApiResponse;
