// src/closure.rs

use std::collections::HashSet;

use tracing::trace;

use crate::graph::{ConfigGraph, NodeKind};

/// Every subflow definition reachable from `seeds` by following subflow
/// instances, transitively.
///
/// Each round only scans containers discovered in the previous round, and an
/// id already in the closure is never re-added, so cyclic subflow references
/// terminate after at most one extra round.
pub fn subflow_closure<'a, I>(graph: &ConfigGraph, seeds: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut closure: HashSet<String> = HashSet::new();
    let mut frontier: HashSet<String> = seeds.into_iter().map(str::to_string).collect();
    let mut round = 0usize;

    while !frontier.is_empty() {
        round += 1;
        let mut discovered: HashSet<String> = HashSet::new();

        for node in graph.iter() {
            let Some(container) = node.container() else {
                continue;
            };
            if !frontier.contains(container) {
                continue;
            }
            if let NodeKind::SubflowInstance(def_id) = node.kind() {
                if !closure.contains(def_id) && !discovered.contains(def_id) {
                    discovered.insert(def_id.to_string());
                }
            }
        }

        trace!(round, added = discovered.len(), "subflow closure round");
        closure.extend(discovered.iter().cloned());
        frontier = discovered;
    }

    closure
}
