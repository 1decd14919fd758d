//! Engine log channel.
//!
//! A background task keeps a WebSocket to `/logs` open, retrying transient
//! failures with exponential backoff. Records land in a bounded ring buffer
//! and are broadcast to live subscribers.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, LogConfig, ServerConfig};
use crate::endpoint::EndpointClient;
use crate::error::{CoreError, ErrorKind};
use crate::events::{CoreEvent, EventBus};

const KEEPALIVE: &str = "ping";
const LIVE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LogState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireRecord {
    #[serde(alias = "type")]
    level: String,
    #[serde(alias = "message")]
    payload: String,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug)]
pub(crate) enum Frame {
    KeepAlive,
    Record(LogRecord),
    Malformed,
}

pub(crate) fn decode_frame(text: &str) -> Frame {
    if text.trim() == KEEPALIVE {
        return Frame::KeepAlive;
    }
    match serde_json::from_str::<WireRecord>(text) {
        Ok(w) => Frame::Record(LogRecord {
            level: w.level,
            payload: w.payload,
            time: w.time,
            received_at: Utc::now(),
        }),
        Err(_) => Frame::Malformed,
    }
}

/// Fixed-capacity log window; the oldest record is evicted first.
pub struct LogBuffer {
    capacity: usize,
    records: VecDeque<LogRecord>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// The most recent `limit` records (all if `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<LogRecord> {
        let skip = match limit {
            Some(n) => self.records.len().saturating_sub(n),
            None => 0,
        };
        self.records.iter().skip(skip).cloned().collect()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LogErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub at_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogStatus {
    pub state: LogState,
    pub level: String,
    /// Whether the caller wants the channel open.
    pub wanted: bool,
    /// Set once retries are exhausted; cleared by the next connect.
    pub gave_up: bool,
    pub last_error: Option<LogErrorInfo>,
}

/// What the run loop does after a session ends with an error.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NextStep {
    Retry(Duration),
    GiveUp,
    Stop,
}

pub(crate) fn backoff(cfg: &BackoffConfig, attempt: u32) -> Duration {
    let shift = attempt.min(16);
    let mul = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let d = cfg.base_ms.saturating_mul(mul).min(cfg.max_ms);
    Duration::from_millis(d)
}

pub(crate) fn next_step(err: &CoreError, attempt: u32, cfg: &BackoffConfig) -> NextStep {
    if err.is_terminal() {
        return NextStep::Stop;
    }
    if attempt >= cfg.max_attempts {
        return NextStep::GiveUp;
    }
    NextStep::Retry(backoff(cfg, attempt))
}

enum SessionEnd {
    Stopped,
    Dropped { error: CoreError, was_connected: bool },
}

struct Runner {
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
pub struct LogStream {
    inner: Arc<Inner>,
}

struct Inner {
    config: LogConfig,
    events: EventBus,
    endpoint: Mutex<Option<EndpointClient>>,
    buffer: Mutex<LogBuffer>,
    status: RwLock<LogStatus>,
    live: broadcast::Sender<LogRecord>,
    runner: Mutex<Option<Runner>>,
}

impl LogStream {
    pub fn new(config: LogConfig, events: EventBus) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let status = LogStatus {
            state: LogState::Disconnected,
            level: config.level.clone(),
            wanted: false,
            gave_up: false,
            last_error: None,
        };
        Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(LogBuffer::new(config.capacity)),
                config,
                events,
                endpoint: Mutex::new(None),
                status: RwLock::new(status),
                live,
                runner: Mutex::new(None),
            }),
        }
    }

    pub async fn status(&self) -> LogStatus {
        self.inner.status.read().await.clone()
    }

    pub async fn server(&self) -> Option<ServerConfig> {
        self.inner
            .endpoint
            .lock()
            .await
            .as_ref()
            .map(|e| e.server().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.inner.live.subscribe()
    }

    pub async fn records(&self, limit: Option<usize>) -> Vec<LogRecord> {
        self.inner.buffer.lock().await.snapshot(limit)
    }

    /// Opens the channel against `endpoint`'s server, replacing any channel
    /// that is already open.
    pub async fn connect(&self, endpoint: EndpointClient) {
        *self.inner.endpoint.lock().await = Some(endpoint);
        {
            let mut status = self.inner.status.write().await;
            status.wanted = true;
            status.gave_up = false;
        }
        self.stop_runner().await;
        self.start_runner().await;
    }

    /// Closes the channel; `clear_buffer` also drops retained records.
    pub async fn disconnect(&self, clear_buffer: bool) {
        self.inner.status.write().await.wanted = false;
        self.stop_runner().await;
        self.inner.set_state(LogState::Disconnected).await;
        if clear_buffer {
            self.inner.buffer.lock().await.clear();
        }
        info!("log stream disconnected");
    }

    /// Reopens the channel with a new level. Returns `false` when the level
    /// is unchanged.
    pub async fn set_level(&self, level: &str) -> bool {
        let wanted = {
            let mut status = self.inner.status.write().await;
            if status.level == level {
                return false;
            }
            status.level = level.to_string();
            status.wanted
        };
        info!("log level -> {}", level);
        if wanted {
            self.stop_runner().await;
            sleep(Duration::from_millis(self.inner.config.level_settle_ms)).await;
            self.start_runner().await;
        }
        true
    }

    /// Restarts the channel if it should be open but its task has ended
    /// (gave up, or stopped on an error). No-op otherwise.
    pub async fn reconnect_if_down(&self) -> bool {
        if !self.inner.status.read().await.wanted {
            return false;
        }
        let running = {
            let guard = self.inner.runner.lock().await;
            guard.as_ref().map(|r| !r.join.is_finished()).unwrap_or(false)
        };
        if running {
            return false;
        }
        info!("log stream down, reconnecting");
        self.inner.status.write().await.gave_up = false;
        self.start_runner().await;
        true
    }

    /// Hook for platform network-change notifications.
    pub async fn notify_network_available(&self) -> bool {
        self.reconnect_if_down().await
    }

    async fn start_runner(&self) {
        let Some(endpoint) = self.inner.endpoint.lock().await.clone() else {
            warn!("log stream has no server to connect to");
            return;
        };
        let level = self.inner.status.read().await.level.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let join = tokio::spawn(async move { run_stream(inner, endpoint, level, stop_rx).await });

        let previous = self.inner.runner.lock().await.replace(Runner { stop_tx, join });
        if let Some(old) = previous {
            let _ = old.stop_tx.send(true);
            let _ = old.join.await;
        }
    }

    async fn stop_runner(&self) {
        let runner = self.inner.runner.lock().await.take();
        if let Some(r) = runner {
            let _ = r.stop_tx.send(true);
            let _ = r.join.await;
        }
    }
}

impl Inner {
    async fn set_state(&self, state: LogState) {
        let changed = {
            let mut status = self.status.write().await;
            let changed = status.state != state;
            status.state = state.clone();
            if matches!(state, LogState::Connected) {
                status.last_error = None;
            }
            changed
        };
        if changed {
            self.events.emit(CoreEvent::LogStateChanged { state });
        }
    }

    async fn record_error(&self, err: &CoreError) {
        let mut status = self.status.write().await;
        status.last_error = Some(LogErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
            at_ms: Utc::now().timestamp_millis(),
        });
    }

    async fn handle_text(&self, text: &str) {
        match decode_frame(text) {
            Frame::KeepAlive => {}
            Frame::Record(record) => {
                self.buffer.lock().await.push(record.clone());
                let _ = self.live.send(record);
            }
            Frame::Malformed => debug!("dropping malformed log frame"),
        }
    }
}

async fn run_stream(
    inner: Arc<Inner>,
    endpoint: EndpointClient,
    level: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let backoff_cfg = inner.config.backoff.clone();
    let mut attempt: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        inner.set_state(LogState::Connecting).await;

        let (error, was_connected) = match session(&inner, &endpoint, &level, &mut stop_rx).await {
            SessionEnd::Stopped => break,
            SessionEnd::Dropped {
                error,
                was_connected,
            } => (error, was_connected),
        };
        inner.record_error(&error).await;
        if was_connected {
            attempt = 0;
        }

        match next_step(&error, attempt, &backoff_cfg) {
            NextStep::Stop => {
                warn!("log stream stopped, not retrying: {}", error);
                break;
            }
            NextStep::GiveUp => {
                warn!(
                    "log stream gave up after {} attempts: {}",
                    attempt, error
                );
                inner.status.write().await.gave_up = true;
                break;
            }
            NextStep::Retry(wait) => {
                attempt = attempt.saturating_add(1);
                warn!(
                    "log stream dropped ({}), retry #{} in {:?}",
                    error, attempt, wait
                );
                inner.set_state(LogState::Reconnecting { attempt }).await;
                tokio::select! {
                    _ = stop_rx.changed() => {},
                    _ = sleep(wait) => {},
                }
            }
        }
    }

    inner.set_state(LogState::Disconnected).await;
}

async fn session(
    inner: &Inner,
    endpoint: &EndpointClient,
    level: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let dropped = |error: CoreError, was_connected: bool| SessionEnd::Dropped {
        error,
        was_connected,
    };

    let token = match endpoint.token().await {
        Ok(t) => t,
        Err(e) => return dropped(e, false),
    };
    let Some(url) = endpoint.logs_url(token.as_deref(), level) else {
        return dropped(
            CoreError::InvalidConfiguration(format!(
                "cannot build a log URL from {}:{}",
                endpoint.server().host,
                endpoint.server().port
            )),
            false,
        );
    };

    let connected = tokio::select! {
        _ = stop_rx.changed() => return SessionEnd::Stopped,
        r = connect_async(url.as_str()) => r,
    };
    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => return dropped(CoreError::from(e), false),
    };
    inner.set_state(LogState::Connected).await;
    info!("log stream connected to {}:{} ({})", endpoint.server().host, endpoint.server().port, level);

    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    let _ = tx.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(t))) => inner.handle_text(&t).await,
                Some(Ok(Message::Binary(b))) => inner.handle_text(&String::from_utf8_lossy(&b)).await,
                Some(Ok(Message::Close(_))) | None => {
                    return dropped(CoreError::Transport("log channel closed by peer".to_string()), true);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return dropped(CoreError::from(e), true),
            }
        }
    }
}
