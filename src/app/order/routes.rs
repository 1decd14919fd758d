use axum::routing::{get, put};
use axum::Router;

use super::handlers::*;
use crate::app::SharedAppState;

pub fn routes() -> Router<SharedAppState> {
    Router::new()
        .route(
            "/api/order",
            get(get_order).put(save_order).delete(clear_order),
        )
        .route("/api/order/mode", put(set_sort_mode))
}
