use axum::routing::{get, post, put};
use axum::Router;

use super::handlers::*;
use crate::app::SharedAppState;

pub fn routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/logs", get(get_logs))
        .route("/api/logs/status", get(get_log_status))
        .route("/api/logs/level", put(set_log_level))
        .route("/api/logs/connect", post(connect_logs))
        .route("/api/logs/disconnect", post(disconnect_logs))
        // 实时推送
        .route("/api/ws/logs", get(ws_logs))
        .route("/api/ws/events", get(ws_events))
}
