use axum::{extract::State, response::Json};
use tracing::info;

use crate::app::{api_error, ApiResponse, ApiResult, SharedAppState};
use crate::error::CoreError;

use super::models::*;

fn current(state: &SharedAppState) -> Result<OrderResponse, CoreError> {
    let sort_mode = state.order.sort_mode(&state.server_id)?;
    let saved = state.order.load_order(&state.server_id)?;
    Ok(OrderResponse::new(&state.server_id, sort_mode, &saved))
}

/// GET /api/order
pub async fn get_order(State(state): State<SharedAppState>) -> ApiResult<OrderResponse> {
    let order = current(&state).map_err(api_error)?;
    Ok(Json(ApiResponse::success("Group order", order)))
}

/// PUT /api/order
pub async fn save_order(
    State(state): State<SharedAppState>,
    Json(req): Json<SaveOrderRequest>,
) -> ApiResult<OrderResponse> {
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = req.names.iter().find(|n| !seen.insert(n.as_str())) {
        return Err(api_error(CoreError::InvalidConfiguration(format!(
            "group {} listed twice",
            dup
        ))));
    }
    state
        .order
        .save_order(&state.server_id, &req.names)
        .map_err(api_error)?;
    info!("saved order of {} groups for {}", req.names.len(), state.server_id);
    let order = current(&state).map_err(api_error)?;
    Ok(Json(ApiResponse::success("Group order saved", order)))
}

/// DELETE /api/order
pub async fn clear_order(State(state): State<SharedAppState>) -> ApiResult<OrderResponse> {
    state.order.clear_order(&state.server_id).map_err(api_error)?;
    let order = current(&state).map_err(api_error)?;
    Ok(Json(ApiResponse::success("Group order cleared", order)))
}

/// PUT /api/order/mode
pub async fn set_sort_mode(
    State(state): State<SharedAppState>,
    Json(req): Json<SortModeRequest>,
) -> ApiResult<OrderResponse> {
    state
        .order
        .set_sort_mode(&state.server_id, req.enabled)
        .map_err(api_error)?;
    let order = current(&state).map_err(api_error)?;
    Ok(Json(ApiResponse::success(
        if req.enabled { "Custom order on" } else { "Custom order off" },
        order,
    )))
}
