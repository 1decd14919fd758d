// UI-facing HTTP API

use axum::{http::StatusCode, response::Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{CoreError, ErrorKind};
use crate::logs::LogStream;
use crate::order::OrderStore;
use crate::prober::DelayProber;
use crate::store::ProxyStore;

pub mod logs;
pub mod order;
pub mod proxies;

pub struct AppState {
    pub store: ProxyStore,
    pub prober: DelayProber,
    pub logs: LogStream,
    pub order: Arc<OrderStore>,
    /// Key under which the group order is persisted.
    pub server_id: String,
}

pub type SharedAppState = Arc<AppState>;

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            kind: None,
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(err: &CoreError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            kind: Some(err.kind()),
            data: None,
        }
    }
}

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidConfiguration => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::AuthFailure
        | ErrorKind::TransportFailure
        | ErrorKind::TlsFailure
        | ErrorKind::DecodeFailure
        | ErrorKind::ServerFailure => StatusCode::BAD_GATEWAY,
    }
}

pub fn api_error(err: CoreError) -> ApiError {
    let status = status_for(err.kind());
    if status.is_server_error() {
        warn!("request failed: {}", err);
    }
    (status, Json(ApiResponse::<()>::error(&err)))
}

pub fn router(state: SharedAppState) -> Router {
    Router::new()
        .merge(proxies::routes())
        .merge(order::routes())
        .merge(logs::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
