//! Whole-graph auto-layout.
//!
//! Rows are the shortest hop depth from any root; columns are branches, where
//! a branch is a first-hop child of a root (or a childless root on its own).
//! Roots with children sit centred over their immediate children.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use weave_core::{Edge, NodeMap};

use crate::placement::{NODE_SPACING_X, NODE_SPACING_Y};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutPosition {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Parent → children links from edges and `parent_ids`, restricted to known
/// nodes, without self-links or duplicates.
fn child_links<'a>(nodes: &'a NodeMap, edges: &'a [Edge]) -> BTreeMap<&'a str, BTreeSet<&'a str>> {
    let mut links: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let pairs = edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .chain(nodes.values().flat_map(|n| {
            n.parent_ids
                .iter()
                .map(move |p| (p.as_str(), n.id.as_str()))
        }));
    for (parent, child) in pairs {
        if parent != child && nodes.contains_key(parent) && nodes.contains_key(child) {
            links.entry(parent).or_default().insert(child);
        }
    }
    links
}

/// Breadth-first walk from every seed at once, so each node gets its
/// shortest hop distance from any seed. A first-hop child of a seed becomes a
/// branch head owned by that seed; deeper nodes inherit their parent's branch.
fn walk<'a>(
    seeds: &[&'a str],
    children: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    depth: &mut HashMap<&'a str, usize>,
    branch_of: &mut HashMap<&'a str, &'a str>,
    claimed: &mut HashMap<&'a str, Vec<&'a str>>,
) {
    let mut queue = VecDeque::new();
    for &seed in seeds {
        depth.insert(seed, 0);
        queue.push_back((seed, 0usize));
    }
    while let Some((current, d)) = queue.pop_front() {
        for &child in children.get(current).into_iter().flatten() {
            if depth.contains_key(child) {
                continue;
            }
            depth.insert(child, d + 1);
            let branch = match branch_of.get(current) {
                Some(branch) => *branch,
                None => {
                    claimed.entry(current).or_default().push(child);
                    child
                }
            };
            branch_of.insert(child, branch);
            queue.push_back((child, d + 1));
        }
    }
}

/// Lay out every node of the graph.
///
/// Deterministic and idempotent: applying the result and running again
/// yields the same positions. Nodes no root reaches (a cycle with no entry)
/// become roots themselves. Output is sorted by node ID.
pub fn auto_layout(nodes: &NodeMap, edges: &[Edge]) -> Vec<LayoutPosition> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let children = child_links(nodes, edges);
    let has_parent: BTreeSet<&str> = children.values().flatten().copied().collect();
    let mut roots: Vec<&str> = nodes
        .keys()
        .map(String::as_str)
        .filter(|id| !has_parent.contains(id))
        .collect();

    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut branch_of: HashMap<&str, &str> = HashMap::new();
    let mut claimed: HashMap<&str, Vec<&str>> = HashMap::new();

    walk(&roots, &children, &mut depth, &mut branch_of, &mut claimed);
    // Anything left is only reachable through a cycle.
    for id in nodes.keys().map(String::as_str) {
        if !depth.contains_key(id) {
            walk(&[id], &children, &mut depth, &mut branch_of, &mut claimed);
            roots.push(id);
        }
    }

    // Branch heads: claimed first-hop children, plus every childless root.
    let mut heads: Vec<&str> = Vec::new();
    for &root in &roots {
        if let Some(owned) = claimed.get(root) {
            heads.extend(owned.iter().copied());
        } else if !children.contains_key(root) {
            branch_of.insert(root, root);
            heads.push(root);
        }
    }
    heads.sort_by(|a, b| {
        let ax = nodes.get(*a).map_or(0.0, |n| n.position.x);
        let bx = nodes.get(*b).map_or(0.0, |n| n.position.x);
        ax.total_cmp(&bx).then_with(|| a.cmp(b))
    });
    let column: HashMap<&str, usize> = heads.iter().enumerate().map(|(i, h)| (*h, i)).collect();

    let mut x: HashMap<&str, f64> = HashMap::new();
    for (&id, branch) in &branch_of {
        if let Some(index) = column.get(branch) {
            x.insert(id, *index as f64 * NODE_SPACING_X);
        }
    }
    // Roots with children sit over them, whichever branch owns the children.
    for &root in &roots {
        if x.contains_key(root) {
            continue;
        }
        let placed: Vec<f64> = children
            .get(root)
            .into_iter()
            .flatten()
            .filter_map(|c| x.get(c).copied())
            .collect();
        let centre = if placed.is_empty() {
            0.0
        } else {
            placed.iter().sum::<f64>() / placed.len() as f64
        };
        x.insert(root, centre);
    }

    let positions: Vec<LayoutPosition> = nodes
        .keys()
        .map(|id| LayoutPosition {
            id: id.clone(),
            x: x.get(id.as_str()).copied().unwrap_or(0.0),
            y: depth.get(id.as_str()).copied().unwrap_or(0) as f64 * NODE_SPACING_Y,
        })
        .collect();
    log::debug!(
        "auto layout placed {} node(s) in {} column(s)",
        positions.len(),
        heads.len()
    );
    positions
}

/// Write layout results back into the node positions.
pub fn apply_layout(nodes: &mut NodeMap, layout: &[LayoutPosition]) {
    for p in layout {
        if let Some(node) = nodes.get_mut(&p.id) {
            node.position.x = p.x;
            node.position.y = p.y;
        }
    }
}
