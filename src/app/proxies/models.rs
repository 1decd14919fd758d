use serde::{Deserialize, Serialize};

use crate::model::{Group, SelectorKind, Snapshot};
use crate::resolver::{delay_stats, resolve, DelayStats};

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize, Clone, Debug)]
pub struct SelectRequest {
    pub name: String,
}

// ============================================================================
// Response Types
// ============================================================================

/// A group as the UI renders it: membership plus what the selection chain
/// finally lands on.
#[derive(Serialize, Clone, Debug)]
pub struct GroupView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SelectorKind,
    pub now: String,
    pub all: Vec<String>,
    pub alive: bool,
    pub resolved_node: String,
    pub resolved_delay: u32,
    pub stats: DelayStats,
    pub testing: bool,
}

impl GroupView {
    pub fn build(snapshot: &Snapshot, group: &Group, testing: bool) -> Self {
        let (resolved_node, resolved_delay) = resolve(snapshot, &group.name);
        Self {
            name: group.name.clone(),
            kind: group.kind.clone(),
            now: group.now.clone(),
            all: group.all.clone(),
            alive: group.alive,
            resolved_node,
            resolved_delay,
            stats: delay_stats(snapshot, &group.name),
            testing,
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct GroupsResponse {
    pub version: u64,
    pub sort_mode: bool,
    pub groups: Vec<GroupView>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ProbesResponse {
    pub testing: Vec<String>,
}
