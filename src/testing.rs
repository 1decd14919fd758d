//! In-process fake engine used by the unit tests.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

use crate::config::{ProbeConfig, ServerConfig};
use crate::endpoint::EndpointClient;

pub const SECRET: &str = "s3cret";

#[derive(Clone, Debug)]
pub enum DelayBehavior {
    Delay(u32),
    /// Engine-side probe timeout (HTTP 504).
    Timeout,
    /// Arbitrary failure status.
    Fail(u16),
    /// Plain HTTP sent to a TLS listener.
    Plaintext,
    /// Never answers within any reasonable test horizon.
    Hang,
}

#[derive(Default)]
pub struct Engine {
    pub proxies: Mutex<Value>,
    pub providers: Mutex<Value>,
    /// Responses for successive `GET /proxies` calls: (latency ms, body).
    pub scripted_proxies: Mutex<VecDeque<(u64, Value)>>,
    pub delays: Mutex<HashMap<String, DelayBehavior>>,
    pub group_delays: Mutex<HashMap<String, Value>>,
    pub selected: Mutex<Vec<(String, String)>>,
    pub healthchecks: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<String>>,
    pub proxies_calls: AtomicUsize,
    pub delay_calls: AtomicUsize,
    active_probes: AtomicUsize,
    pub max_active_probes: AtomicUsize,
}

impl Engine {
    pub fn set_proxies(&self, proxies: Value) {
        *self.proxies.lock().unwrap() = json!({ "proxies": proxies });
    }

    pub fn set_providers(&self, providers: Value) {
        *self.providers.lock().unwrap() = json!({ "providers": providers });
    }

    pub fn set_delay(&self, name: &str, behavior: DelayBehavior) {
        self.delays.lock().unwrap().insert(name.to_string(), behavior);
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", SECRET))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"}))).into_response()
}

async fn get_proxies(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    engine.proxies_calls.fetch_add(1, Ordering::SeqCst);
    let scripted = engine.scripted_proxies.lock().unwrap().pop_front();
    if let Some((latency, body)) = scripted {
        sleep(Duration::from_millis(latency)).await;
        return Json(json!({ "proxies": body })).into_response();
    }
    let body = engine.proxies.lock().unwrap().clone();
    Json(body).into_response()
}

async fn get_providers(State(engine): State<Arc<Engine>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let body = engine.providers.lock().unwrap().clone();
    Json(body).into_response()
}

async fn select_proxy(
    State(engine): State<Arc<Engine>>,
    Path(group): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let target = body["name"].as_str().unwrap_or_default().to_string();
    {
        let mut proxies = engine.proxies.lock().unwrap();
        if let Some(entry) = proxies["proxies"].get_mut(&group) {
            entry["now"] = json!(target.clone());
        }
    }
    engine.selected.lock().unwrap().push((group, target));
    StatusCode::NO_CONTENT.into_response()
}

async fn run_delay(engine: &Engine, name: &str) -> Response {
    engine.delay_calls.fetch_add(1, Ordering::SeqCst);
    let active = engine.active_probes.fetch_add(1, Ordering::SeqCst) + 1;
    engine.max_active_probes.fetch_max(active, Ordering::SeqCst);
    let behavior = engine.delays.lock().unwrap().get(name).cloned();
    // Give concurrent probes a chance to overlap.
    sleep(Duration::from_millis(20)).await;
    let resp = match behavior {
        Some(DelayBehavior::Delay(d)) => Json(json!({ "delay": d })).into_response(),
        Some(DelayBehavior::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, Json(json!({"message": "Timeout"}))).into_response()
        }
        Some(DelayBehavior::Fail(code)) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"message": "boom"})),
        )
            .into_response(),
        Some(DelayBehavior::Plaintext) => (
            StatusCode::BAD_REQUEST,
            "Client sent an HTTP request to an HTTPS server.\n",
        )
            .into_response(),
        Some(DelayBehavior::Hang) => {
            sleep(Duration::from_secs(3600)).await;
            StatusCode::OK.into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"message": "resource not found"}))).into_response(),
    };
    engine.active_probes.fetch_sub(1, Ordering::SeqCst);
    resp
}

async fn proxy_delay(State(engine): State<Arc<Engine>>, Path(name): Path<String>) -> Response {
    run_delay(&engine, &name).await
}

async fn group_delay(State(engine): State<Arc<Engine>>, Path(name): Path<String>) -> Response {
    engine.delay_calls.fetch_add(1, Ordering::SeqCst);
    match engine.group_delays.lock().unwrap().get(&name).cloned() {
        Some(body) => Json(body).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"message": "resource not found"}))).into_response(),
    }
}

async fn update_provider(State(engine): State<Arc<Engine>>, Path(name): Path<String>) -> Response {
    engine.updates.lock().unwrap().push(name);
    StatusCode::NO_CONTENT.into_response()
}

async fn provider_healthcheck(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Response {
    engine.healthchecks.lock().unwrap().push(name);
    StatusCode::NO_CONTENT.into_response()
}

async fn provider_proxy_healthcheck(
    State(engine): State<Arc<Engine>>,
    Path((provider, proxy)): Path<(String, String)>,
) -> Response {
    engine
        .healthchecks
        .lock()
        .unwrap()
        .push(format!("{}/{}", provider, proxy));
    run_delay(&engine, &proxy).await
}

async fn version() -> Json<Value> {
    Json(json!({"version": "fake"}))
}

pub struct FakeEngine {
    pub engine: Arc<Engine>,
    pub server: ServerConfig,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let engine = Arc::new(Engine::default());
        engine.set_proxies(json!({}));
        engine.set_providers(json!({}));

        let app = Router::new()
            .route("/version", get(version))
            .route("/proxies", get(get_proxies))
            .route("/proxies/{name}", put(select_proxy))
            .route("/proxies/{name}/delay", get(proxy_delay))
            .route("/group/{name}/delay", get(group_delay))
            .route("/providers/proxies", get(get_providers))
            .route("/providers/proxies/{name}", put(update_provider))
            .route("/providers/proxies/{name}/healthcheck", get(provider_healthcheck))
            .route(
                "/providers/proxies/{name}/{proxy}/healthcheck",
                get(provider_proxy_healthcheck),
            )
            .with_state(engine.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut server = ServerConfig::new("127.0.0.1", addr.port());
        server.secret = Some(SECRET.to_string());
        Self { engine, server }
    }

    pub fn endpoint(&self) -> EndpointClient {
        EndpointClient::with_secret(self.server.clone(), fast_probe_config()).unwrap()
    }
}

pub fn fast_probe_config() -> ProbeConfig {
    ProbeConfig {
        settle_ms: 10,
        ..ProbeConfig::default()
    }
}

/// Polls `check` until it holds or the deadline passes.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}
