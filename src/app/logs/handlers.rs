use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{Json, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::app::{api_error, ApiResponse, ApiResult, SharedAppState};
use crate::error::CoreError;
use crate::logs::LogStatus;

use super::models::*;

const VALID_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "silent"];

/// GET /api/logs
pub async fn get_logs(
    State(state): State<SharedAppState>,
    Query(params): Query<LogListParams>,
) -> ApiResult<LogListResponse> {
    let records = state.logs.records(params.limit).await;
    let status = state.logs.status().await;
    Ok(Json(ApiResponse::success(
        format!("{} records", records.len()),
        LogListResponse { records, status },
    )))
}

/// GET /api/logs/status
pub async fn get_log_status(State(state): State<SharedAppState>) -> ApiResult<LogStatus> {
    Ok(Json(ApiResponse::success("Log stream status", state.logs.status().await)))
}

/// PUT /api/logs/level
pub async fn set_log_level(
    State(state): State<SharedAppState>,
    Json(req): Json<LevelRequest>,
) -> ApiResult<LogStatus> {
    let level = req.level.trim().to_ascii_lowercase();
    if !VALID_LEVELS.contains(&level.as_str()) {
        return Err(api_error(CoreError::InvalidConfiguration(format!(
            "unknown log level {}",
            req.level
        ))));
    }
    let changed = state.logs.set_level(&level).await;
    let message = if changed { "Log level changed" } else { "Log level unchanged" };
    Ok(Json(ApiResponse::success(message, state.logs.status().await)))
}

/// POST /api/logs/connect
pub async fn connect_logs(State(state): State<SharedAppState>) -> ApiResult<LogStatus> {
    state.store.endpoint().server().check().map_err(api_error)?;
    state.logs.connect(state.store.endpoint().clone()).await;
    Ok(Json(ApiResponse::success("Log stream starting", state.logs.status().await)))
}

/// POST /api/logs/disconnect
pub async fn disconnect_logs(
    State(state): State<SharedAppState>,
    Query(params): Query<DisconnectParams>,
) -> ApiResult<LogStatus> {
    state.logs.disconnect(params.clear).await;
    Ok(Json(ApiResponse::success("Log stream stopped", state.logs.status().await)))
}

/// GET /api/ws/logs
pub async fn ws_logs(State(state): State<SharedAppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.logs.subscribe();
    ws.on_upgrade(move |socket| forward(socket, rx, "logs"))
}

/// GET /api/ws/events
pub async fn ws_events(State(state): State<SharedAppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.store.events().subscribe();
    ws.on_upgrade(move |socket| forward(socket, rx, "events"))
}

/// Pushes every broadcast item to the client as a JSON text frame until
/// either side goes away.
async fn forward<T>(socket: WebSocket, mut rx: broadcast::Receiver<T>, what: &'static str)
where
    T: Serialize + Clone + Send + 'static,
{
    let (mut tx, mut client_rx) = socket.split();
    info!("ws {} client attached", what);

    let push = async {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let Ok(text) = serde_json::to_string(&item) else {
                        continue;
                    };
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("ws {} client lagged, {} items dropped", what, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = tx.send(Message::Close(None)).await;
    };

    let drain = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = push => {},
        _ = drain => {},
    }
    info!("ws {} client detached", what);
}
