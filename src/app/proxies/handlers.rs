use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::info;

use crate::app::{api_error, ApiResponse, ApiResult, SharedAppState};
use crate::model::Snapshot;
use crate::order::sorted_groups;
use crate::prober::ProbeReport;

use super::models::*;

// ============================================================================
// Snapshot
// ============================================================================

/// GET /api/snapshot
pub async fn get_snapshot(State(state): State<SharedAppState>) -> ApiResult<Snapshot> {
    let snapshot = state.store.snapshot();
    Ok(Json(ApiResponse::success("Snapshot", (*snapshot).clone())))
}

/// POST /api/refresh
pub async fn refresh(State(state): State<SharedAppState>) -> ApiResult<Snapshot> {
    let snapshot = state.store.refresh().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Refreshed to v{}", snapshot.version),
        (*snapshot).clone(),
    )))
}

/// GET /api/engine/version
///
/// Connectivity check against the configured engine.
pub async fn engine_version(State(state): State<SharedAppState>) -> ApiResult<serde_json::Value> {
    let version = state.store.endpoint().version().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success("Engine reachable", version)))
}

// ============================================================================
// Groups
// ============================================================================

/// GET /api/groups
pub async fn get_groups(State(state): State<SharedAppState>) -> ApiResult<GroupsResponse> {
    let snapshot = state.store.snapshot();
    let sort_mode = state.order.sort_mode(&state.server_id).map_err(api_error)?;
    let saved = state.order.load_order(&state.server_id).map_err(api_error)?;

    let groups = sorted_groups(&snapshot.groups, sort_mode, &saved)
        .into_iter()
        .map(|g| GroupView::build(&snapshot, g, state.prober.is_testing(&g.name)))
        .collect();

    Ok(Json(ApiResponse::success(
        "Groups",
        GroupsResponse {
            version: snapshot.version,
            sort_mode,
            groups,
        },
    )))
}

/// PUT /api/groups/{group}
pub async fn select_proxy(
    State(state): State<SharedAppState>,
    Path(group): Path<String>,
    Json(req): Json<SelectRequest>,
) -> ApiResult<ProbeReport> {
    let report = state
        .prober
        .select_and_probe(&group, &req.name)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Switched {} to {}", group, req.name),
        report,
    )))
}

/// POST /api/groups/{group}/delay
pub async fn probe_group(
    State(state): State<SharedAppState>,
    Path(group): Path<String>,
) -> ApiResult<ProbeReport> {
    let report = state.prober.probe_group(&group).await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Tested {} members of {}", report.updated.len(), group),
        report,
    )))
}

// ============================================================================
// Nodes
// ============================================================================

/// POST /api/nodes/{node}/delay
pub async fn probe_node(
    State(state): State<SharedAppState>,
    Path(node): Path<String>,
) -> ApiResult<ProbeReport> {
    let report = state.prober.probe_single(&node).await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(format!("Tested {}", node), report)))
}

/// GET /api/probes
pub async fn get_probes(State(state): State<SharedAppState>) -> ApiResult<ProbesResponse> {
    Ok(Json(ApiResponse::success(
        "Probes in flight",
        ProbesResponse {
            testing: state.prober.in_flight(),
        },
    )))
}

// ============================================================================
// Providers
// ============================================================================

/// POST /api/providers/{name}/healthcheck
pub async fn provider_healthcheck(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
) -> ApiResult<Snapshot> {
    let snapshot = state
        .prober
        .probe_provider_healthcheck(&name, None)
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Health-checked {}", name),
        (*snapshot).clone(),
    )))
}

/// POST /api/providers/{name}/{proxy}/healthcheck
pub async fn provider_proxy_healthcheck(
    State(state): State<SharedAppState>,
    Path((name, proxy)): Path<(String, String)>,
) -> ApiResult<Snapshot> {
    let snapshot = state
        .prober
        .probe_provider_healthcheck(&name, Some(&proxy))
        .await
        .map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Health-checked {} in {}", proxy, name),
        (*snapshot).clone(),
    )))
}

/// PUT /api/providers/{name}
///
/// Asks the engine to re-pull the subscription, then refreshes.
pub async fn update_provider(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
) -> ApiResult<Snapshot> {
    state
        .store
        .endpoint()
        .update_provider(&name)
        .await
        .map_err(api_error)?;
    info!("provider {} updated", name);
    let snapshot = state.store.refresh().await.map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        format!("Updated {}", name),
        (*snapshot).clone(),
    )))
}
