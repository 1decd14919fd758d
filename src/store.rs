//! Owns the published snapshot.
//!
//! Readers get an `Arc<Snapshot>` that never changes underneath them; every
//! write (a refresh commit or a batch of delay results) replaces the value in
//! a single `watch` update. A refresh only commits if no newer refresh has
//! started since it began.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointClient;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::merger::merge;
use crate::model::{ProvidersResponse, ProxiesResponse, Snapshot};

#[derive(Clone)]
pub struct ProxyStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    endpoint: EndpointClient,
    events: EventBus,
    snapshot: watch::Sender<Arc<Snapshot>>,
    generation: AtomicU64,
    active_refresh: Mutex<CancellationToken>,
}

impl ProxyStore {
    pub fn new(endpoint: EndpointClient, events: EventBus) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            inner: Arc::new(StoreInner {
                endpoint,
                events,
                snapshot,
                generation: AtomicU64::new(0),
                active_refresh: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> &EndpointClient {
        &self.inner.endpoint
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.inner.snapshot.subscribe()
    }

    async fn fetch(&self) -> Result<(ProxiesResponse, ProvidersResponse), CoreError> {
        let endpoint = &self.inner.endpoint;
        tokio::try_join!(endpoint.proxies(), endpoint.providers())
    }

    /// Fetches both listings and publishes the merged result. Starting a
    /// refresh cancels any refresh still in progress; a cancelled or
    /// superseded refresh returns [`CoreError::Cancelled`] and publishes
    /// nothing.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, CoreError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        {
            let mut active = self
                .inner
                .active_refresh
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let previous = std::mem::replace(&mut *active, token.clone());
            previous.cancel();
        }

        let fetched = tokio::select! {
            _ = token.cancelled() => Err(CoreError::Cancelled),
            r = self.fetch() => r,
        };
        let (proxies, providers) = match fetched {
            Ok(v) => v,
            Err(CoreError::Cancelled) => {
                debug!("refresh #{} superseded before fetch completed", generation);
                return Err(CoreError::Cancelled);
            }
            Err(e) => {
                warn!("refresh #{} failed: {}", generation, e);
                self.inner.events.emit(CoreEvent::refresh_failed(&e));
                return Err(e);
            }
        };

        let mut published: Option<Arc<Snapshot>> = None;
        let mut skipped = Vec::new();
        self.inner.snapshot.send_if_modified(|current| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            let merged = merge(&proxies, &providers, current);
            let mut snapshot = merged.snapshot;
            snapshot.version = current.version + 1;
            skipped = merged.skipped;
            *current = Arc::new(snapshot);
            published = Some(current.clone());
            true
        });

        for (name, err) in skipped {
            self.inner.events.emit(CoreEvent::ProviderSkipped {
                name,
                detail: err.to_string(),
            });
        }

        match published {
            Some(snapshot) => {
                info!(
                    "published snapshot v{}: {} nodes, {} groups, {} providers",
                    snapshot.version,
                    snapshot.nodes.len(),
                    snapshot.groups.len(),
                    snapshot.providers.len()
                );
                self.inner.events.emit(CoreEvent::SnapshotPublished {
                    version: snapshot.version,
                });
                Ok(snapshot)
            }
            None => {
                debug!("refresh #{} superseded, result discarded", generation);
                Err(CoreError::Cancelled)
            }
        }
    }

    /// Applies probe results to the published node table. Returns the names
    /// that exist in the current snapshot and were updated.
    pub fn apply_delays(&self, delays: &HashMap<String, u32>) -> Vec<String> {
        if delays.is_empty() {
            return Vec::new();
        }
        let mut updated = Vec::new();
        self.inner.snapshot.send_if_modified(|current| {
            let mut next = (**current).clone();
            updated = next.apply_delays(delays, Utc::now());
            if updated.is_empty() {
                return false;
            }
            next.version = current.version + 1;
            *current = Arc::new(next);
            true
        });
        if !updated.is_empty() {
            self.inner.events.emit(CoreEvent::DelaysUpdated {
                names: updated.clone(),
            });
        }
        updated
    }
}
