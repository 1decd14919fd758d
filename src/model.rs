use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const GLOBAL: &str = "GLOBAL";

pub const SPECIAL_TYPE: &str = "Special";

/// Samples kept per node; the engine reports a longer tail we don't need.
pub const HISTORY_LIMIT: usize = 10;

pub fn is_special(name: &str) -> bool {
    name == DIRECT || name == REJECT
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelaySample {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub delay: u32,
}

#[derive(Debug, Deserialize)]
pub struct ProxiesResponse {
    #[serde(default)]
    pub proxies: HashMap<String, RawProxy>,
}

/// One entry of `GET /proxies`, or of a provider's `proxies` array.
#[derive(Clone, Debug, Deserialize)]
pub struct RawProxy {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub proxy_type: String,
    #[serde(default)]
    pub alive: Option<bool>,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub all: Option<Vec<String>>,
    #[serde(default)]
    pub history: Vec<DelaySample>,
    #[serde(default)]
    pub id: Option<String>,
}

impl RawProxy {
    pub fn last_delay(&self) -> u32 {
        self.history.last().map(|h| h.delay).unwrap_or(0)
    }

    pub fn is_selector(&self) -> bool {
        matches!(
            SelectorKind::from(self.proxy_type.as_str()),
            SelectorKind::Selector | SelectorKind::UrlTest
        )
    }
}

/// `GET /providers/proxies`; entries stay untyped so one malformed provider
/// can be skipped without failing the listing.
#[derive(Debug, Deserialize)]
pub struct ProvidersResponse {
    #[serde(default)]
    pub providers: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawProvider {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub provider_type: String,
    #[serde(rename = "vehicleType", default)]
    pub vehicle_type: String,
    #[serde(default)]
    pub proxies: Vec<RawProxy>,
    #[serde(rename = "testUrl", default)]
    pub test_url: Option<String>,
    #[serde(rename = "subscriptionInfo", default)]
    pub subscription_info: Option<SubscriptionInfo>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
}

/// Subscription counters; the engine capitalizes these keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionInfo {
    #[serde(rename(deserialize = "Upload"), default)]
    pub upload: u64,
    #[serde(rename(deserialize = "Download"), default)]
    pub download: u64,
    #[serde(rename(deserialize = "Total"), default)]
    pub total: u64,
    #[serde(rename(deserialize = "Expire"), default)]
    pub expire: i64,
}

// ============================================================================
// Merged model
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorKind {
    Selector,
    UrlTest,
    Other(String),
}

impl SelectorKind {
    pub fn as_str(&self) -> &str {
        match self {
            SelectorKind::Selector => "Selector",
            SelectorKind::UrlTest => "URLTest",
            SelectorKind::Other(s) => s,
        }
    }
}

impl Serialize for SelectorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl From<&str> for SelectorKind {
    fn from(s: &str) -> Self {
        match s {
            "Selector" => SelectorKind::Selector,
            "URLTest" => SelectorKind::UrlTest,
            other => SelectorKind::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub alive: bool,
    /// Milliseconds; 0 means untested or timed out.
    pub delay: u32,
    pub history: Vec<DelaySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Node {
    pub fn special(name: &str, delay: u32) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            node_type: SPECIAL_TYPE.to_string(),
            alive: true,
            delay,
            history: Vec::new(),
            provider: None,
        }
    }

    pub fn from_raw(raw: &RawProxy, provider: Option<&str>) -> Self {
        let mut history = raw.history.clone();
        if history.len() > HISTORY_LIMIT {
            history.drain(..history.len() - HISTORY_LIMIT);
        }
        Self {
            id: raw.id.clone().unwrap_or_else(|| raw.name.clone()),
            name: raw.name.clone(),
            node_type: raw.proxy_type.clone(),
            alive: raw.alive.unwrap_or(true),
            delay: raw.last_delay(),
            history,
            provider: provider.map(|p| p.to_string()),
        }
    }

    pub fn record_delay(&mut self, delay: u32, at: DateTime<Utc>) {
        self.delay = delay;
        self.alive = delay > 0;
        self.history.push(DelaySample {
            time: at.to_rfc3339(),
            delay,
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Group {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SelectorKind,
    pub now: String,
    pub all: Vec<String>,
    pub alive: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Provider {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub vehicle_type: String,
    pub node_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_info: Option<SubscriptionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Provider {
    /// Only HTTP-sourced or subscription-backed providers are manageable.
    pub fn is_visible(raw: &RawProvider) -> bool {
        raw.vehicle_type.eq_ignore_ascii_case("HTTP") || raw.subscription_info.is_some()
    }
}

/// One published view of the engine. Never mutated after publication; the
/// store replaces it with a modified copy.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub nodes: Vec<Node>,
    pub groups: Vec<Group>,
    pub providers: Vec<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    node_index: HashMap<String, usize>,
    #[serde(skip)]
    group_index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new(nodes: Vec<Node>, groups: Vec<Group>, providers: Vec<Provider>) -> Self {
        let mut snapshot = Self {
            version: 0,
            nodes,
            groups,
            providers,
            fetched_at: None,
            node_index: HashMap::new(),
            group_index: HashMap::new(),
        };
        snapshot.reindex();
        snapshot
    }

    fn reindex(&mut self) {
        self.node_index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        self.group_index = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.node_index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.group_index.get(name).map(|&i| &self.groups[i])
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn delay_of(&self, name: &str) -> u32 {
        self.node(name).map(|n| n.delay).unwrap_or(0)
    }

    /// Applies probe results. Names not present in the node table are
    /// ignored; returns the names that were updated.
    pub fn apply_delays(&mut self, delays: &HashMap<String, u32>, at: DateTime<Utc>) -> Vec<String> {
        let mut updated = Vec::new();
        for (name, delay) in delays {
            if let Some(&i) = self.node_index.get(name) {
                self.nodes[i].record_delay(*delay, at);
                updated.push(name.clone());
            }
        }
        updated.sort();
        updated
    }
}
