//! Consistency engine: cycle detection, topological ordering and staleness
//! cascades over a graph snapshot.
//!
//! All functions are pure. Depth-first search runs on an explicit frame stack
//! so adversarial or very deep graphs cannot exhaust the call stack.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::CycleError;
use crate::model::{Edge, Node, NodeId, NodeMap};

/// Outcome of a cycle search.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub has_cycle: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<NodeId>>,
}

impl CycleReport {
    fn found(cycle: Vec<NodeId>) -> Self {
        Self {
            has_cycle: true,
            cycle: Some(cycle),
        }
    }
}

type Adjacency<'a> = HashMap<&'a str, Vec<&'a str>>;

/// Outgoing adjacency (source → targets) in edge order.
fn adjacency(edges: &[Edge]) -> Adjacency<'_> {
    let mut adj: Adjacency<'_> = HashMap::with_capacity(edges.len());
    for edge in edges {
        adj.entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }
    adj
}

/// Iterative DFS over `adj` starting from each of `starts` in order.
///
/// Returns the first cycle met, closed on the repeated node.
fn find_cycle<'a, I>(starts: I, adj: &Adjacency<'a>) -> Option<Vec<NodeId>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut on_stack: HashSet<&'a str> = HashSet::new();
    let mut parent: HashMap<&'a str, &'a str> = HashMap::new();

    for start in starts {
        if !visited.insert(start) {
            continue;
        }
        on_stack.insert(start);
        // Frame: (node, index of the next neighbour to explore)
        let mut stack: Vec<(&'a str, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next_idx) = *frame;
            let neighbours = adj.get(node).map(Vec::as_slice).unwrap_or(&[]);

            if next_idx < neighbours.len() {
                frame.1 += 1;
                let next = neighbours[next_idx];
                if on_stack.contains(next) {
                    return Some(close_cycle(node, next, &parent));
                }
                if visited.insert(next) {
                    parent.insert(next, node);
                    on_stack.insert(next);
                    stack.push((next, 0));
                }
            } else {
                on_stack.remove(node);
                stack.pop();
            }
        }
    }

    None
}

/// Walk the DFS parent map from `current` back to `repeated`.
fn close_cycle(current: &str, repeated: &str, parent: &HashMap<&str, &str>) -> Vec<NodeId> {
    let mut cycle = vec![current.to_string()];
    let mut cursor = current;
    while cursor != repeated {
        match parent.get(cursor) {
            Some(&p) => {
                cycle.push(p.to_string());
                cursor = p;
            }
            None => break,
        }
    }
    cycle.reverse();
    cycle.push(repeated.to_string());
    cycle
}

/// Search the graph for a dependency cycle.
///
/// DFS roots are taken in node-map order, so the reported cycle is
/// deterministic for a given snapshot.
pub fn detect_cycle(nodes: &NodeMap, edges: &[Edge]) -> CycleReport {
    let adj = adjacency(edges);
    match find_cycle(nodes.keys().map(String::as_str), &adj) {
        Some(cycle) => CycleReport::found(cycle),
        None => CycleReport::default(),
    }
}

/// Order node IDs so every edge's source precedes its target (Kahn).
///
/// Edges touching unknown nodes are ignored.
pub fn topological_sort(nodes: &NodeMap, edges: &[Edge]) -> Result<Vec<NodeId>, CycleError> {
    let mut in_degree: HashMap<&str, usize> =
        nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let mut adj: Adjacency<'_> = HashMap::new();

    for edge in edges {
        if nodes.contains_key(&edge.source) && nodes.contains_key(&edge.target) {
            adj.entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
            if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .keys()
        .map(String::as_str)
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for &child in adj.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = in_degree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() < nodes.len() {
        let cycle = detect_cycle(nodes, edges).cycle.unwrap_or_default();
        return Err(CycleError::new(cycle));
    }
    Ok(order)
}

/// Whether adding `source → target` to `edges` would close a cycle.
///
/// Runs on a hypothetical adjacency; `edges` is not touched.
pub fn would_create_cycle(source: &str, target: &str, edges: &[Edge]) -> bool {
    cycle_with_edge(source, target, edges).is_some()
}

/// The cycle that adding `source → target` to `edges` would produce, if any.
///
/// The search starts at `source`, so a cycle through the new edge is the
/// one reported when there are several.
pub fn cycle_with_edge(source: &str, target: &str, edges: &[Edge]) -> Option<Vec<NodeId>> {
    if source == target {
        return Some(vec![source.to_string(), target.to_string()]);
    }
    let mut adj = adjacency(edges);
    adj.entry(source).or_default().push(target);

    let mut rest: Vec<&str> = adj.keys().copied().filter(|id| *id != source).collect();
    rest.sort_unstable();
    find_cycle(std::iter::once(source).chain(rest), &adj)
}

/// Mark every transitive dependent of `node_id` stale.
///
/// Breadth-first along outgoing edges. `on_update` fires exactly once per
/// affected node with the updated copy; the changed node itself is never
/// marked. The graph is assumed acyclic: a cycle is absorbed by the visited
/// set rather than reported.
pub fn cascade_update<F>(
    node_id: &str,
    nodes: &NodeMap,
    edges: &[Edge],
    now: u64,
    mut on_update: F,
) -> Vec<NodeId>
where
    F: FnMut(&str, &Node),
{
    let adj = adjacency(edges);
    let mut visited: HashSet<&str> = HashSet::from([node_id]);
    let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
    let mut affected = Vec::new();

    while let Some(current) = queue.pop_front() {
        for &next in adj.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if !visited.insert(next) {
                continue;
            }
            if let Some(node) = nodes.get(next) {
                let updated = node.staled(now);
                on_update(next, &updated);
                affected.push(next.to_string());
            }
            queue.push_back(next);
        }
    }

    log::debug!("cascade from {node_id} marked {} node(s) stale", affected.len());
    affected
}

/// Collect the stale copies produced by [`cascade_update`].
pub fn stale_dependents(node_id: &str, nodes: &NodeMap, edges: &[Edge], now: u64) -> Vec<Node> {
    let mut updated = Vec::new();
    cascade_update(node_id, nodes, edges, now, |_, node| updated.push(node.clone()));
    updated
}
