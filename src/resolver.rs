//! Follows a group's active member through nested groups down to a concrete
//! node.

use serde::Serialize;
use std::collections::HashSet;

use crate::model::Snapshot;

pub const LOW_DELAY_MAX: u32 = 150;
pub const MEDIUM_DELAY_MAX: u32 = 300;

/// Resolves `name` to `(effective_node, delay)`. A cycle or an unknown name
/// resolves to delay 0.
pub fn resolve(snapshot: &Snapshot, name: &str) -> (String, u32) {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = name;
    // The visited set already guarantees termination; the cap guards against
    // a listing that violates the name-uniqueness assumption.
    let cap = snapshot.nodes.len() + snapshot.groups.len() + 1;

    for _ in 0..=cap {
        if !visited.insert(current) {
            return (current.to_string(), 0);
        }
        if let Some(group) = snapshot.group(current) {
            current = group.now.as_str();
            continue;
        }
        if let Some(node) = snapshot.node(current) {
            return (current.to_string(), node.delay);
        }
        return (current.to_string(), 0);
    }
    (current.to_string(), 0)
}

pub fn resolve_delay(snapshot: &Snapshot, name: &str) -> u32 {
    resolve(snapshot, name).1
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DelayStats {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub timeout: usize,
}

impl DelayStats {
    pub fn record(&mut self, delay: u32) {
        match delay {
            0 => self.timeout += 1,
            1..=LOW_DELAY_MAX => self.low += 1,
            d if d <= MEDIUM_DELAY_MAX => self.medium += 1,
            _ => self.high += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.medium + self.high + self.timeout
    }
}

/// Buckets every member of `group` by its resolved delay. Unknown groups give
/// empty stats.
pub fn delay_stats(snapshot: &Snapshot, group: &str) -> DelayStats {
    let mut stats = DelayStats::default();
    if let Some(g) = snapshot.group(group) {
        for member in &g.all {
            stats.record(resolve_delay(snapshot, member));
        }
    }
    stats
}
