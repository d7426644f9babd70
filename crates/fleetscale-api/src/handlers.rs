//! REST API handlers.
//!
//! Demand handlers only touch the engine's accumulators and return at once;
//! `POST /fleet/update` is the one route that waits on the remote fleet.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetscale_engine::{FleetStatus, NodeRegistry};
use fleetscale_state::{ComputerInfo, FleetStateSnapshot, InstanceId, TerminationReason, WorkerNode};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Fleet ──────────────────────────────────────────────────────

/// GET /api/v1/fleet
pub async fn fleet_status(State(state): State<ApiState>) -> Json<ApiResponse<FleetStatus>> {
    ApiResponse::ok(state.engine.status())
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    /// Executors the scheduler could not place.
    pub workload: u32,
    /// Label the queued work asked for, if any.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub accepted: usize,
    pub unit_ids: Vec<u64>,
}

/// POST /api/v1/fleet/provision
///
/// Demand for a label this fleet does not serve is answered with zero
/// accepted units. Each accepted unit is watched by a background task that
/// logs how it settled.
pub async fn provision(
    State(state): State<ApiState>,
    Json(req): Json<ProvisionRequest>,
) -> Json<ApiResponse<ProvisionResponse>> {
    if !state.engine.can_provision(req.label.as_deref()) {
        return ApiResponse::ok(ProvisionResponse {
            accepted: 0,
            unit_ids: Vec::new(),
        });
    }
    let units = state.engine.provision(req.workload);
    let response = ProvisionResponse {
        accepted: units.len(),
        unit_ids: units.iter().map(|u| u.id()).collect(),
    };

    for unit in units {
        tokio::spawn(async move {
            let unit_id = unit.id();
            match unit.wait().await {
                Ok(node) => {
                    info!(unit_id, instance_id = %node.instance_id, "planned unit fulfilled")
                }
                Err(reason) => debug!(unit_id, %reason, "planned unit cancelled"),
            }
        });
    }

    ApiResponse::ok(response)
}

fn default_reason() -> TerminationReason {
    TerminationReason::Manual
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_reason")]
    pub reason: TerminationReason,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TerminateResponse {
    pub accepted: bool,
}

/// POST /api/v1/fleet/terminate
pub async fn terminate(
    State(state): State<ApiState>,
    Json(req): Json<TerminateRequest>,
) -> Json<ApiResponse<TerminateResponse>> {
    let accepted = state
        .engine
        .schedule_to_terminate(&req.instance_id, req.force, req.reason);
    ApiResponse::ok(TerminateResponse { accepted })
}

/// POST /api/v1/fleet/update
pub async fn run_update(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.update().await {
        Ok(snapshot) => {
            let snapshot: Option<FleetStateSnapshot> = snapshot.map(|s| (*s).clone());
            ApiResponse::ok(snapshot).into_response()
        }
        Err(e) => {
            warn!(error = %e, "manual fleet update failed");
            error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub pending_add: u32,
    pub pending_terminations: BTreeMap<InstanceId, TerminationReason>,
    pub planned_units: usize,
}

/// GET /api/v1/fleet/pending
pub async fn pending(State(state): State<ApiState>) -> Json<ApiResponse<PendingResponse>> {
    ApiResponse::ok(PendingResponse {
        pending_add: state.engine.pending_add(),
        pending_terminations: state.engine.instances_pending_termination(),
        planned_units: state.engine.planned_units(),
    })
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Json<ApiResponse<Vec<ComputerInfo>>> {
    ApiResponse::ok(state.registry.list_computers())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeView {
    pub node: WorkerNode,
    pub computer: ComputerInfo,
}

/// GET /api/v1/nodes/:id
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let node = state.registry.get_node(&id);
    let computer = state.registry.get_computer(&id);
    match (node, computer) {
        (Some(node), Some(computer)) => ApiResponse::ok(NodeView { node, computer }).into_response(),
        _ => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// POST /api/v1/nodes/:id/busy
pub async fn mark_busy(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.registry.mark_busy(&id) {
        ApiResponse::ok("busy").into_response()
    } else {
        error_response("node not found", StatusCode::NOT_FOUND).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IdleRequest {
    /// Count the finished build against the node's use budget.
    #[serde(default)]
    pub build_completed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdleResponse {
    pub uses: u32,
}

/// POST /api/v1/nodes/:id/idle
pub async fn mark_idle(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<IdleRequest>,
) -> impl IntoResponse {
    if !state.registry.mark_idle(&id, epoch_secs()) {
        return error_response("node not found", StatusCode::NOT_FOUND).into_response();
    }
    let uses = if req.build_completed {
        state.registry.record_use(&id)
    } else {
        state.registry.get_computer(&id).map(|c| c.uses)
    };
    ApiResponse::ok(IdleResponse {
        uses: uses.unwrap_or_default(),
    })
    .into_response()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetscale_engine::{
        BackendError, FleetEngine, InMemoryRegistry, ScalingConfig, SimulatedFleet,
        SimulatedFleetOptions,
    };
    use fleetscale_state::FleetTarget;

    fn test_state(initial: u32) -> (ApiState, Arc<SimulatedFleet>) {
        let fleet = Arc::new(SimulatedFleet::new(
            "sfr-api",
            SimulatedFleetOptions {
                initial_capacity: initial,
                ..Default::default()
            },
        ));
        let registry = Arc::new(InMemoryRegistry::new());
        let target = FleetTarget {
            region: "us-east-1".to_string(),
            fleet_id: "sfr-api".to_string(),
            ..Default::default()
        };
        let engine = Arc::new(FleetEngine::new(
            target,
            ScalingConfig::default(),
            fleet.clone(),
            fleet.clone(),
            registry.clone(),
        ));
        (ApiState { engine, registry }, fleet)
    }

    #[tokio::test]
    async fn status_before_discovery() {
        let (state, _) = test_state(0);
        let Json(resp) = fleet_status(State(state)).await;
        let status = resp.data.unwrap();
        assert!(status.snapshot.is_none());
        assert_eq!(status.pending_add, 0);
        assert_eq!(status.max_size, 10);
    }

    #[tokio::test]
    async fn update_then_list_nodes() {
        let (state, _) = test_state(2);
        let resp = run_update(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let Json(resp) = list_nodes(State(state)).await;
        assert_eq!(resp.data.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_failure_is_bad_gateway() {
        let (state, fleet) = test_state(1);
        fleet.fail_get_state(Some(BackendError::Request("timeout".to_string())));
        let resp = run_update(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn provision_reports_pending() {
        let (state, _) = test_state(1);
        state.engine.update().await.unwrap();

        let resp = provision(State(state.clone()), Json(ProvisionRequest {
                workload: 3,
                label: None,
            }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let Json(resp) = pending(State(state)).await;
        let pending = resp.data.unwrap();
        assert_eq!(pending.pending_add, 3);
        assert_eq!(pending.planned_units, 3);
    }

    #[tokio::test]
    async fn provision_for_foreign_label_is_refused() {
        let (state, _) = test_state(1);
        state.engine.update().await.unwrap();

        let req = ProvisionRequest {
            workload: 2,
            label: Some("gpu".to_string()),
        };
        let Json(resp) = provision(State(state.clone()), Json(req)).await;
        assert_eq!(resp.data.unwrap().accepted, 0);
        assert_eq!(state.engine.pending_add(), 0);
        assert_eq!(state.engine.planned_units(), 0);
    }

    #[tokio::test]
    async fn terminate_defaults_to_manual() {
        let (state, fleet) = test_state(2);
        state.engine.update().await.unwrap();
        let id = fleet.instance_ids()[0].clone();

        let req: TerminateRequest =
            serde_json::from_value(serde_json::json!({ "instance_id": id })).unwrap();
        assert!(!req.force);
        let Json(resp) = terminate(State(state.clone()), Json(req)).await;
        assert!(resp.data.unwrap().accepted);

        let pending = state.engine.instances_pending_termination();
        assert_eq!(pending.get(&id), Some(&TerminationReason::Manual));
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let (state, _) = test_state(0);
        let resp = get_node(State(state.clone()), Path("i-404".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = mark_busy(State(state), Path("i-404".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn busy_then_idle_counts_use() {
        let (state, fleet) = test_state(1);
        state.engine.update().await.unwrap();
        let id = fleet.instance_ids()[0].clone();

        let resp = mark_busy(State(state.clone()), Path(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.registry.get_computer(&id).unwrap().busy);

        let resp = mark_idle(
            State(state.clone()),
            Path(id.clone()),
            Json(IdleRequest {
                build_completed: true,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let computer = state.registry.get_computer(&id).unwrap();
        assert!(computer.is_idle());
        assert_eq!(computer.uses, 1);
    }
}
