//! Latency probes against live nodes.
//!
//! A name is marked in-flight by an [`InFlightGuard`] for exactly as long as
//! its request runs; dropping the guard (on success, error, or when the
//! probing future is dropped) clears the mark.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::endpoint::DelayMap;
use crate::error::{CoreError, ErrorKind};
use crate::events::CoreEvent;
use crate::model::{is_special, Snapshot, REJECT};
use crate::store::ProxyStore;

type InFlightSet = Arc<Mutex<HashSet<String>>>;

pub struct InFlightGuard {
    set: InFlightSet,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.name);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProbeFailure {
    pub name: String,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ProbeReport {
    /// Nodes whose delay changed in the published snapshot.
    pub updated: Vec<String>,
    /// Names skipped because a probe for them was already running.
    pub skipped: Vec<String>,
    pub failed: Vec<ProbeFailure>,
}

#[derive(Clone)]
pub struct DelayProber {
    store: ProxyStore,
    in_flight: InFlightSet,
}

impl DelayProber {
    pub fn new(store: ProxyStore) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Marks `name` in-flight, or returns `None` if it already is.
    pub fn try_acquire(&self, name: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(name.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_testing(&self, name: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    pub fn in_flight(&self) -> Vec<String> {
        let set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = set.iter().cloned().collect();
        names.sort();
        names
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.store.endpoint().probe_config().settle_ms)
    }

    async fn probe_member(
        &self,
        name: String,
        is_group: bool,
    ) -> (String, Result<Option<DelayMap>, CoreError>) {
        let Some(_guard) = self.try_acquire(&name) else {
            return (name, Ok(None));
        };
        let endpoint = self.store.endpoint();
        let result = if is_group {
            endpoint.group_delay(&name).await
        } else {
            endpoint.proxy_delay(&name).await
        };
        (name, result.map(Some))
    }

    /// Tests every direct member of `group` except DIRECT/REJECT.
    ///
    /// Per-member failures are collected in the report. A TLS or
    /// configuration failure aborts the batch, since every remaining request
    /// would fail the same way.
    pub async fn probe_group(&self, group: &str) -> Result<ProbeReport, CoreError> {
        let snapshot = self.store.snapshot();
        let members = group_members(&snapshot, group)?;
        let concurrency = self.store.endpoint().probe_config().concurrency.max(1);
        info!("probing {} members of {}", members.len(), group);

        let mut results = stream::iter(members.into_iter().map(|(name, is_group)| {
            self.probe_member(name, is_group)
        }))
        .buffer_unordered(concurrency);

        let mut report = ProbeReport::default();
        while let Some((name, outcome)) = results.next().await {
            self.absorb(&mut report, name, outcome)?;
        }
        report.updated.sort();
        report.updated.dedup();
        Ok(report)
    }

    /// Tests one node. REJECT is never tested.
    pub async fn probe_single(&self, node: &str) -> Result<ProbeReport, CoreError> {
        let mut report = ProbeReport::default();
        if node == REJECT {
            report.skipped.push(node.to_string());
            return Ok(report);
        }
        let is_group = self.store.snapshot().group(node).is_some();
        let (name, outcome) = self.probe_member(node.to_string(), is_group).await;
        self.absorb(&mut report, name, outcome)?;
        Ok(report)
    }

    fn absorb(
        &self,
        report: &mut ProbeReport,
        name: String,
        outcome: Result<Option<DelayMap>, CoreError>,
    ) -> Result<(), CoreError> {
        match outcome {
            Ok(None) => {
                debug!("{} already being tested", name);
                report.skipped.push(name);
            }
            Ok(Some(delays)) => {
                report.updated.extend(self.store.apply_delays(&delays));
            }
            Err(e) if e.is_terminal() => {
                warn!("probe of {} hit a transport misconfiguration: {}", name, e);
                self.store.events().emit(CoreEvent::probe_failed(&name, &e));
                return Err(e);
            }
            Err(e) => {
                warn!("probe of {} failed: {}", name, e);
                self.store.events().emit(CoreEvent::probe_failed(&name, &e));
                report.failed.push(ProbeFailure {
                    name,
                    kind: e.kind(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Asks the engine to health-check a whole provider, or one proxy of it,
    /// then refreshes to pick up the engine's results.
    pub async fn probe_provider_healthcheck(
        &self,
        provider: &str,
        proxy: Option<&str>,
    ) -> Result<Arc<Snapshot>, CoreError> {
        let snapshot = self.store.snapshot();
        if snapshot.provider(provider).is_none() {
            return Err(CoreError::NotFound(format!("provider {}", provider)));
        }
        let endpoint = self.store.endpoint();
        match proxy {
            Some(proxy) => {
                let Some(_guard) = self.try_acquire(proxy) else {
                    debug!("{} already being tested", proxy);
                    return Ok(snapshot);
                };
                let delay = endpoint.provider_proxy_healthcheck(provider, proxy).await?;
                self.store
                    .apply_delays(&HashMap::from([(proxy.to_string(), delay)]));
            }
            None => {
                let _guards: Vec<InFlightGuard> = snapshot
                    .nodes
                    .iter()
                    .filter(|n| n.provider.as_deref() == Some(provider))
                    .filter_map(|n| self.try_acquire(&n.name))
                    .collect();
                endpoint.provider_healthcheck(provider).await?;
            }
        }
        sleep(self.settle()).await;
        match self.store.refresh().await {
            Err(CoreError::Cancelled) => {
                debug!("healthcheck refresh of {} superseded", provider);
                Ok(self.store.snapshot())
            }
            other => other,
        }
    }

    /// Switches `group` to `proxy`, refreshes, then tests the new selection.
    pub async fn select_and_probe(&self, group: &str, proxy: &str) -> Result<ProbeReport, CoreError> {
        let snapshot = self.store.snapshot();
        let g = snapshot
            .group(group)
            .ok_or_else(|| CoreError::NotFound(format!("group {}", group)))?;
        if !g.all.iter().any(|m| m == proxy) {
            return Err(CoreError::NotFound(format!("{} in group {}", proxy, group)));
        }
        self.store.endpoint().select_proxy(group, proxy).await?;
        info!("selected {} in {}", proxy, group);
        sleep(self.settle()).await;
        match self.store.refresh().await {
            Ok(_) => {}
            // a newer refresh already carries the selection
            Err(CoreError::Cancelled) => debug!("post-select refresh of {} superseded", group),
            Err(e) => return Err(e),
        }
        self.probe_single(proxy).await
    }
}

/// Direct members of `group` that may be tested, with whether each is
/// itself a group.
fn group_members(snapshot: &Snapshot, group: &str) -> Result<Vec<(String, bool)>, CoreError> {
    let g = snapshot
        .group(group)
        .ok_or_else(|| CoreError::NotFound(format!("group {}", group)))?;
    let mut seen = HashSet::new();
    Ok(g.all
        .iter()
        .filter(|m| !is_special(m))
        .filter(|m| seen.insert(m.as_str()))
        .map(|m| (m.clone(), snapshot.group(m).is_some()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::endpoint::EndpointClient;
    use crate::events::EventBus;
    use crate::model::DIRECT;
    use crate::testing::{fast_probe_config, wait_until, DelayBehavior, FakeEngine};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    async fn setup(proxies: serde_json::Value, providers: serde_json::Value) -> (FakeEngine, DelayProber) {
        let fake = FakeEngine::start().await;
        fake.engine.set_proxies(proxies);
        fake.engine.set_providers(providers);
        let store = ProxyStore::new(fake.endpoint(), EventBus::new());
        store.refresh().await.unwrap();
        (fake, DelayProber::new(store))
    }

    fn sub_providers(nodes: &[&str]) -> serde_json::Value {
        let proxies: Vec<_> = nodes.iter().map(|n| json!({"name": n, "type": "Vmess"})).collect();
        json!({"sub": {"name": "sub", "type": "Proxy", "vehicleType": "HTTP", "proxies": proxies}})
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let set: InFlightSet = Arc::new(Mutex::new(HashSet::new()));
        set.lock().unwrap().insert("HK".to_string());
        let guard = InFlightGuard {
            set: set.clone(),
            name: "HK".to_string(),
        };
        drop(guard);
        assert!(set.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_group_updates_and_clears_in_flight() {
        let (fake, prober) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "HK",
                "all": ["DIRECT", "HK", "JP", "US", "REJECT"]}}),
            sub_providers(&["HK", "JP", "US"]),
        )
        .await;
        fake.engine.set_delay("HK", DelayBehavior::Delay(80));
        fake.engine.set_delay("JP", DelayBehavior::Timeout);
        fake.engine.set_delay("US", DelayBehavior::Fail(500));

        let report = prober.probe_group("Proxy").await.unwrap();

        assert_eq!(report.updated, vec!["HK".to_string(), "JP".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "US");
        assert_eq!(report.failed[0].kind, ErrorKind::ServerFailure);
        assert!(prober.in_flight().is_empty());

        let snap = prober.store.snapshot();
        assert_eq!(snap.delay_of("HK"), 80);
        assert_eq!(snap.delay_of("JP"), 0);
        assert!(!snap.node("JP").unwrap().alive);
        // DIRECT and REJECT were never requested
        assert_eq!(fake.engine.delay_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_group_respects_concurrency_limit() {
        let names: Vec<String> = (0..6).map(|i| format!("N{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (fake, _) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "N0", "all": names}}),
            sub_providers(&refs),
        )
        .await;
        for n in &names {
            fake.engine.set_delay(n, DelayBehavior::Delay(10));
        }
        let mut probe = crate::testing::fast_probe_config();
        probe.concurrency = 2;
        let endpoint = crate::endpoint::EndpointClient::with_secret(fake.server.clone(), probe).unwrap();
        let store = ProxyStore::new(endpoint, EventBus::new());
        store.refresh().await.unwrap();
        let prober = DelayProber::new(store);

        let report = prober.probe_group("Proxy").await.unwrap();
        assert_eq!(report.updated.len(), 6);
        assert!(fake.engine.max_active_probes.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_plaintext_response_stops_batch() {
        let (fake, prober) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "A", "all": ["A"]}}),
            sub_providers(&["A"]),
        )
        .await;
        fake.engine.set_delay("A", DelayBehavior::Plaintext);

        let err = prober.probe_group("Proxy").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TlsFailure);
        assert!(prober.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_on_tls_named_node_keeps_batch() {
        let fake = FakeEngine::start().await;
        fake.engine.set_proxies(json!({"Proxy": {"name": "Proxy", "type": "Selector",
            "now": "HK-TLS-01", "all": ["HK-TLS-01", "B", "C"]}}));
        fake.engine.set_providers(sub_providers(&["HK-TLS-01", "B", "C"]));
        // keeps the client-side timeout short for the hanging member
        let probe = ProbeConfig {
            timeout_ms: 1,
            ..fast_probe_config()
        };
        let endpoint = EndpointClient::with_secret(fake.server.clone(), probe).unwrap();
        let store = ProxyStore::new(endpoint, EventBus::new());
        store.refresh().await.unwrap();
        let prober = DelayProber::new(store);

        fake.engine.set_delay("HK-TLS-01", DelayBehavior::Hang);
        fake.engine.set_delay("B", DelayBehavior::Delay(30));
        fake.engine.set_delay("C", DelayBehavior::Delay(45));

        let report = prober.probe_group("Proxy").await.unwrap();
        assert_eq!(report.updated, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "HK-TLS-01");
        assert_eq!(report.failed[0].kind, ErrorKind::TransportFailure);
        assert!(prober.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_probe_clears_in_flight() {
        let (fake, prober) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "A", "all": ["A", "B"]}}),
            sub_providers(&["A", "B"]),
        )
        .await;
        fake.engine.set_delay("A", DelayBehavior::Hang);
        fake.engine.set_delay("B", DelayBehavior::Hang);

        let task = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.probe_group("Proxy").await })
        };
        assert!(wait_until(|| prober.in_flight().len() == 2).await);

        // a concurrent request for the same node is deduplicated
        let dup = prober.probe_single("A").await.unwrap();
        assert_eq!(dup.skipped, vec!["A".to_string()]);

        task.abort();
        let _ = task.await;
        assert!(prober.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_nested_group_member_uses_group_endpoint() {
        let (fake, prober) = setup(
            json!({
                "Proxy": {"name": "Proxy", "type": "Selector", "now": "Auto", "all": ["Auto", "HK"]},
                "Auto": {"name": "Auto", "type": "URLTest", "now": "JP", "all": ["JP"]}
            }),
            sub_providers(&["HK", "JP"]),
        )
        .await;
        fake.engine.set_delay("HK", DelayBehavior::Delay(40));
        fake.engine
            .group_delays
            .lock()
            .unwrap()
            .insert("Auto".to_string(), json!({"JP": 110, "Auto": 110}));

        let report = prober.probe_group("Proxy").await.unwrap();
        assert_eq!(
            report.updated,
            vec!["Auto".to_string(), "HK".to_string(), "JP".to_string()]
        );
        assert_eq!(crate::resolver::resolve(&prober.store.snapshot(), "Proxy"), ("JP".to_string(), 110));
    }

    #[tokio::test]
    async fn test_probe_single_direct_survives_refresh() {
        let (fake, prober) = setup(json!({}), json!({})).await;
        fake.engine.set_delay(DIRECT, DelayBehavior::Delay(3));

        let report = prober.probe_single(DIRECT).await.unwrap();
        assert_eq!(report.updated, vec![DIRECT.to_string()]);

        let snap = prober.store.refresh().await.unwrap();
        assert_eq!(snap.delay_of(DIRECT), 3);

        let rejected = prober.probe_single(REJECT).await.unwrap();
        assert_eq!(rejected.skipped, vec![REJECT.to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_group_is_not_found() {
        let (_fake, prober) = setup(json!({}), json!({})).await;
        let err = prober.probe_group("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_provider_healthcheck_refreshes() {
        let (fake, prober) = setup(json!({}), sub_providers(&["HK"])).await;
        let before = prober.store.snapshot().version;

        fake.engine.set_providers(json!({"sub": {"name": "sub", "type": "Proxy", "vehicleType": "HTTP",
            "proxies": [{"name": "HK", "type": "Vmess", "history": [{"time": "t", "delay": 66}]}]}}));
        let snap = prober.probe_provider_healthcheck("sub", None).await.unwrap();

        assert_eq!(fake.engine.healthchecks.lock().unwrap().clone(), vec!["sub".to_string()]);
        assert!(snap.version > before);
        assert_eq!(snap.delay_of("HK"), 66);
        assert!(prober.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_provider_single_healthcheck() {
        let (fake, prober) = setup(json!({}), sub_providers(&["HK"])).await;
        fake.engine.set_delay("HK", DelayBehavior::Delay(91));

        prober
            .probe_provider_healthcheck("sub", Some("HK"))
            .await
            .unwrap();
        assert_eq!(
            fake.engine.healthchecks.lock().unwrap().clone(),
            vec!["sub/HK".to_string()]
        );
    }

    #[tokio::test]
    async fn test_select_and_probe() {
        let (fake, prober) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "HK", "all": ["HK", "JP"]}}),
            sub_providers(&["HK", "JP"]),
        )
        .await;
        fake.engine.set_delay("JP", DelayBehavior::Delay(120));

        let report = prober.select_and_probe("Proxy", "JP").await.unwrap();
        assert_eq!(report.updated, vec!["JP".to_string()]);
        assert_eq!(
            fake.engine.selected.lock().unwrap().clone(),
            vec![("Proxy".to_string(), "JP".to_string())]
        );
        let snap = prober.store.snapshot();
        assert_eq!(snap.group("Proxy").unwrap().now, "JP");
        assert_eq!(crate::resolver::resolve(&snap, "Proxy"), ("JP".to_string(), 120));

        let err = prober.select_and_probe("Proxy", "XX").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_select_and_probe_survives_superseded_refresh() {
        let (fake, prober) = setup(
            json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "HK", "all": ["HK", "JP"]}}),
            sub_providers(&["HK", "JP"]),
        )
        .await;
        fake.engine.set_delay("JP", DelayBehavior::Delay(120));
        let switched = json!({"Proxy": {"name": "Proxy", "type": "Selector", "now": "JP", "all": ["HK", "JP"]}});
        {
            let mut scripted = fake.engine.scripted_proxies.lock().unwrap();
            scripted.push_back((300, switched.clone()));
            scripted.push_back((0, switched));
        }
        let calls = fake.engine.proxies_calls.load(Ordering::SeqCst);

        let task = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.select_and_probe("Proxy", "JP").await })
        };
        // the post-select refresh is in flight; a UI refresh overtakes it
        assert!(wait_until(|| fake.engine.proxies_calls.load(Ordering::SeqCst) > calls).await);
        let snap = prober.store.refresh().await.unwrap();
        assert_eq!(snap.group("Proxy").unwrap().now, "JP");

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.updated, vec!["JP".to_string()]);
        assert_eq!(fake.engine.delay_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prober.store.snapshot().group("Proxy").unwrap().now, "JP");
    }

    #[tokio::test]
    async fn test_provider_healthcheck_survives_superseded_refresh() {
        let (fake, prober) = setup(json!({}), sub_providers(&["HK"])).await;
        fake.engine.scripted_proxies.lock().unwrap().push_back((300, json!({})));
        let calls = fake.engine.proxies_calls.load(Ordering::SeqCst);

        let task = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.probe_provider_healthcheck("sub", None).await })
        };
        assert!(wait_until(|| fake.engine.proxies_calls.load(Ordering::SeqCst) > calls).await);
        prober.store.refresh().await.unwrap();

        let snap = task.await.unwrap().unwrap();
        assert!(snap.provider("sub").is_some());
        assert_eq!(fake.engine.healthchecks.lock().unwrap().clone(), vec!["sub".to_string()]);
        assert!(prober.in_flight().is_empty());
    }
}
