//! Bounded scope traversal and relevance scoring.
//!
//! A scope is the neighbourhood of a root node: ancestors reached through
//! `parent_ids`, descendants reached through the reverse relation, both capped
//! at a hop limit. Each entry remembers which first-hop branch led to it so
//! whole branches can be included or dropped together.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::model::{Node, NodeId, NodeMap, META_TIER};

pub const DEFAULT_MAX_DEPTH: usize = 3;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeDirection {
    Parents,
    Children,
    #[default]
    Both,
}

impl ScopeDirection {
    fn includes_parents(self) -> bool {
        matches!(self, ScopeDirection::Parents | ScopeDirection::Both)
    }

    fn includes_children(self) -> bool {
        matches!(self, ScopeDirection::Children | ScopeDirection::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeOptions {
    pub direction: ScopeDirection,
    pub max_depth: usize,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            direction: ScopeDirection::Both,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// One node's position inside a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEntry {
    pub node_id: NodeId,
    /// Minimum hop distance from the root in either direction.
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_depth: Option<usize>,
    /// First-hop node IDs through which this node was reached.
    #[serde(default)]
    pub branches: BTreeSet<NodeId>,
}

impl ScopeEntry {
    fn new(node_id: &str, depth: usize) -> Self {
        Self {
            node_id: node_id.to_string(),
            depth,
            parent_depth: None,
            child_depth: None,
            branches: BTreeSet::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }
}

pub type Scope = BTreeMap<NodeId, ScopeEntry>;

#[derive(Clone, Copy)]
enum Walk {
    Up,
    Down,
}

/// Collect the bounded neighbourhood of `root`.
///
/// Returns an empty map when `root` is not in `nodes`.
pub fn compute_scope(root: &str, nodes: &NodeMap, options: &ScopeOptions) -> Scope {
    let mut scope = Scope::new();
    if !nodes.contains_key(root) {
        return scope;
    }
    scope.insert(root.to_string(), ScopeEntry::new(root, 0));

    // Children derived from parent links so a map without rebuilt
    // `children_ids` still walks correctly.
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes.values() {
        for parent in &node.parent_ids {
            if parent != &node.id {
                children.entry(parent.as_str()).or_default().push(node.id.as_str());
            }
        }
    }

    if options.direction.includes_parents() {
        walk(root, nodes, &children, Walk::Up, options.max_depth, &mut scope);
    }
    if options.direction.includes_children() {
        walk(root, nodes, &children, Walk::Down, options.max_depth, &mut scope);
    }
    scope
}

fn walk(
    root: &str,
    nodes: &NodeMap,
    children: &HashMap<&str, Vec<&str>>,
    way: Walk,
    max_depth: usize,
    scope: &mut Scope,
) {
    // Best depth per (node, branch).
    let mut best: HashMap<(&str, &str), usize> = HashMap::new();
    let mut queue: VecDeque<(&str, Option<&str>, usize)> = VecDeque::new();
    queue.push_back((root, None, 0));

    while let Some((current, branch, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let next: Vec<&str> = match way {
            Walk::Up => nodes
                .get(current)
                .map(|n| n.parent_ids.iter().map(String::as_str).collect())
                .unwrap_or_default(),
            Walk::Down => children.get(current).cloned().unwrap_or_default(),
        };

        for neighbour in next {
            if neighbour == root || !nodes.contains_key(neighbour) {
                continue;
            }
            let branch_id = branch.unwrap_or(neighbour);
            let reached = depth + 1;
            match best.get(&(neighbour, branch_id)) {
                Some(&known) if known <= reached => continue,
                _ => {
                    best.insert((neighbour, branch_id), reached);
                }
            }

            let entry = scope
                .entry(neighbour.to_string())
                .or_insert_with(|| ScopeEntry::new(neighbour, reached));
            entry.depth = entry.depth.min(reached);
            let side = match way {
                Walk::Up => &mut entry.parent_depth,
                Walk::Down => &mut entry.child_depth,
            };
            *side = Some(side.map_or(reached, |d| d.min(reached)));
            entry.branches.insert(branch_id.to_string());

            queue.push_back((neighbour, Some(branch_id), reached));
        }
    }
}

/// Node IDs in `scope` reached through `branch_id`.
pub fn branch_members(scope: &Scope, branch_id: &str) -> Vec<NodeId> {
    scope
        .values()
        .filter(|e| e.branches.contains(branch_id))
        .map(|e| e.node_id.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicScore {
    pub score: u8,
    pub tier: u8,
    pub reasons: Vec<String>,
}

fn tier_for(score: u8) -> u8 {
    match score {
        75.. => 1,
        40.. => 2,
        _ => 3,
    }
}

/// Score a scope entry for context selection.
pub fn compute_heuristic_score(node: &Node, entry: &ScopeEntry, now: u64) -> HeuristicScore {
    let mut reasons = Vec::new();

    if node.is_pinned() {
        reasons.push("pinned by user".to_string());
        return HeuristicScore {
            score: 100,
            tier: 1,
            reasons,
        };
    }

    let distance = (100.0 - entry.depth as f64 * 20.0).clamp(0.0, 100.0) * 0.6;
    reasons.push(format!("distance {} (+{distance:.0})", entry.depth));

    let direction = match (entry.parent_depth, entry.child_depth) {
        (Some(_), Some(_)) => {
            reasons.push("ancestor and descendant (+8)".to_string());
            8.0
        }
        (Some(_), None) => {
            reasons.push("ancestor (+8)".to_string());
            8.0
        }
        (None, Some(_)) => {
            reasons.push("descendant (+4)".to_string());
            4.0
        }
        (None, None) => 0.0,
    };

    let role = node.role();
    let role_bonus = match role {
        Some("source") => 20.0,
        Some("plan") | Some("artifact") => 15.0,
        Some("challenger") => 5.0,
        _ => 10.0,
    };
    reasons.push(format!("role {} (+{role_bonus:.0})", role.unwrap_or("none")));

    let age = now.saturating_sub(node.updated_at);
    let recency = if age <= HOUR_MS {
        reasons.push("updated within the hour (+5)".to_string());
        5.0
    } else if age <= DAY_MS {
        reasons.push("updated within the day (+2)".to_string());
        2.0
    } else {
        0.0
    };

    if let Some(prior) = node.score_explanation() {
        reasons.push(format!("prior: {prior}"));
    }
    if let Some(tier) = node.metadata.get(META_TIER).and_then(Value::as_u64) {
        reasons.push(format!("previous tier {tier}"));
    }

    let score = (distance + direction + role_bonus + recency)
        .round()
        .clamp(0.0, 100.0) as u8;
    HeuristicScore {
        score,
        tier: tier_for(score),
        reasons,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    pub scope: ScopeOptions,
    pub max_nodes: usize,
    /// Entries scored in a worse tier are left out.
    pub max_tier: u8,
    pub now: u64,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            scope: ScopeOptions::default(),
            max_nodes: 20,
            max_tier: 3,
            now: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCandidate {
    pub node_id: NodeId,
    pub depth: usize,
    pub score: HeuristicScore,
}

fn rank(a: &ContextCandidate, b: &ContextCandidate) -> Ordering {
    a.score
        .tier
        .cmp(&b.score.tier)
        .then(b.score.score.cmp(&a.score.score))
        .then(a.depth.cmp(&b.depth))
        .then(a.node_id.cmp(&b.node_id))
}

/// Pick the nodes that should feed a model call rooted at `root`.
///
/// The root always comes first regardless of its tier; the rest are ranked
/// by tier, score, depth and ID.
pub fn select_context(root: &str, nodes: &NodeMap, options: &ContextOptions) -> Vec<ContextCandidate> {
    let scope = compute_scope(root, nodes, &options.scope);
    let mut head = None;
    let mut rest = Vec::new();

    for entry in scope.values() {
        let Some(node) = nodes.get(&entry.node_id) else {
            continue;
        };
        let candidate = ContextCandidate {
            node_id: entry.node_id.clone(),
            depth: entry.depth,
            score: compute_heuristic_score(node, entry, options.now),
        };
        if entry.node_id == root {
            head = Some(candidate);
        } else if candidate.score.tier <= options.max_tier {
            rest.push(candidate);
        }
    }

    rest.sort_by(rank);
    let mut selected: Vec<ContextCandidate> = head.into_iter().chain(rest).collect();
    selected.truncate(options.max_nodes);
    log::debug!(
        "context for {root}: {} of {} scoped nodes",
        selected.len(),
        scope.len()
    );
    selected
}
