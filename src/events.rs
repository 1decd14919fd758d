use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{CoreError, ErrorKind};
use crate::logs::LogState;

const EVENT_CAPACITY: usize = 256;

/// Cross-component notifications. Subscribers hold a receiver for as long as
/// they care and drop it to unsubscribe.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    SnapshotPublished { version: u64 },
    RefreshFailed { kind: ErrorKind, detail: String },
    ProviderSkipped { name: String, detail: String },
    DelaysUpdated { names: Vec<String> },
    ProbeFailed { name: String, kind: ErrorKind, detail: String },
    LogStateChanged { state: LogState },
}

impl CoreEvent {
    pub fn refresh_failed(err: &CoreError) -> Self {
        CoreEvent::RefreshFailed {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }

    pub fn probe_failed(name: &str, err: &CoreError) -> Self {
        CoreEvent::ProbeFailed {
            name: name.to_string(),
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is fine.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}
