use axum::routing::{get, post, put};
use axum::Router;

use super::handlers::*;
use crate::app::SharedAppState;

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/refresh", post(refresh))
        .route("/api/engine/version", get(engine_version))
        // 策略组
        .route("/api/groups", get(get_groups))
        .route("/api/groups/{group}", put(select_proxy))
        .route("/api/groups/{group}/delay", post(probe_group))
        // 节点测速
        .route("/api/nodes/{node}/delay", post(probe_node))
        .route("/api/probes", get(get_probes))
        // 订阅
        .route("/api/providers/{name}", put(update_provider))
        .route("/api/providers/{name}/healthcheck", post(provider_healthcheck))
        .route(
            "/api/providers/{name}/{proxy}/healthcheck",
            post(provider_proxy_healthcheck),
        )
}
