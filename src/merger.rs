//! Builds one consistent node/group graph out of the proxy listing and the
//! provider listing.

use chrono::Utc;
use std::collections::HashSet;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{
    Group, Node, Provider, ProvidersResponse, ProxiesResponse, RawProvider, RawProxy,
    SelectorKind, Snapshot, DIRECT, REJECT,
};

pub struct Merged {
    pub snapshot: Snapshot,
    /// Provider entries that failed to decode and were left out.
    pub skipped: Vec<(String, CoreError)>,
}

/// Merges both listings. `previous` is the currently published snapshot and
/// only contributes the measured delay of the special nodes.
pub fn merge(proxies: &ProxiesResponse, providers: &ProvidersResponse, previous: &Snapshot) -> Merged {
    let mut skipped = Vec::new();

    let mut provider_names: Vec<&String> = providers.providers.keys().collect();
    provider_names.sort();

    let mut visible_providers = Vec::new();
    let mut provider_nodes = Vec::new();
    for key in provider_names {
        let raw: RawProvider = match serde_json::from_value(providers.providers[key].clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("skipping provider {}: {}", key, e);
                skipped.push((key.clone(), CoreError::from(e)));
                continue;
            }
        };
        if !Provider::is_visible(&raw) {
            continue;
        }
        let name = if raw.name.is_empty() { key.clone() } else { raw.name.clone() };
        for proxy in raw.proxies.iter().filter(|p| !p.name.is_empty()) {
            provider_nodes.push(Node::from_raw(proxy, Some(&name)));
        }
        visible_providers.push(Provider {
            name,
            provider_type: raw.provider_type,
            vehicle_type: raw.vehicle_type,
            node_count: raw.proxies.len(),
            test_url: raw.test_url,
            subscription_info: raw.subscription_info,
            updated_at: raw.updated_at,
        });
    }

    let mut entries: Vec<&RawProxy> = proxies.proxies.values().collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut groups = Vec::new();
    let mut selector_nodes = Vec::new();
    for entry in &entries {
        if let Some(all) = &entry.all {
            groups.push(Group {
                name: entry.name.clone(),
                kind: SelectorKind::from(entry.proxy_type.as_str()),
                now: entry.now.clone().unwrap_or_default(),
                all: all.clone(),
                alive: entry.alive.unwrap_or(true),
            });
        }
        if entry.is_selector() {
            selector_nodes.push(Node::from_raw(entry, None));
        }
    }

    let special = [DIRECT, REJECT].map(|name| special_node(name, proxies, previous));

    let mut seen = HashSet::new();
    let nodes: Vec<Node> = special
        .into_iter()
        .chain(selector_nodes)
        .chain(provider_nodes)
        .filter(|n| seen.insert(n.name.clone()))
        .collect();

    let mut snapshot = Snapshot::new(nodes, groups, visible_providers);
    snapshot.fetched_at = Some(Utc::now());
    Merged { snapshot, skipped }
}

/// DIRECT/REJECT keep their last measured delay across refreshes so the UI
/// doesn't flicker back to "untested".
fn special_node(name: &str, proxies: &ProxiesResponse, previous: &Snapshot) -> Node {
    if let Some(prev) = previous.node(name).filter(|n| n.delay > 0) {
        return prev.clone();
    }
    let delay = proxies
        .proxies
        .get(name)
        .map(|raw| raw.last_delay())
        .unwrap_or(0);
    Node::special(name, delay)
}
