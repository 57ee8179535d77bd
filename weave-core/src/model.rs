//! Graph model: prompt/response nodes linked by dependency edges.
//!
//! Nodes carry their parent links inline (`parent_ids`); edges are the
//! materialized form of the same relation. `children_ids` is always derived
//! and is rebuilt from `parent_ids` whenever a snapshot is assembled.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque node identifier.
pub type NodeId = String;

/// Nodes keyed by ID. Ordered so every traversal is reproducible.
pub type NodeMap = BTreeMap<NodeId, Node>;

/// Metadata key holding the node's logical role (`source`, `plan`, ...).
pub const META_ROLE: &str = "role";
/// Metadata key holding the pin flag.
pub const META_PINNED: &str = "pinned";
/// Metadata key holding a previously assigned tier.
pub const META_TIER: &str = "tier";
/// Metadata key holding an externally supplied score explanation.
pub const META_SCORE_EXPLANATION: &str = "scoreExplanation";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generation status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Loading,
    Error,
    Stale,
}

/// Canvas position in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A prompt/response unit in the idea graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub parent_ids: Vec<NodeId>,
    /// Derived from other nodes' `parent_ids`; never trusted from input.
    #[serde(default)]
    pub children_ids: Vec<NodeId>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            response: None,
            summary: None,
            status: NodeStatus::Idle,
            position: Position::ORIGIN,
            parent_ids: Vec::new(),
            children_ids: Vec::new(),
            metadata: Map::new(),
            updated_at: 0,
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.parent_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: u64) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Logical role from metadata, if any.
    pub fn role(&self) -> Option<&str> {
        self.metadata.get(META_ROLE).and_then(Value::as_str)
    }

    pub fn is_pinned(&self) -> bool {
        self.metadata
            .get(META_PINNED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn score_explanation(&self) -> Option<&str> {
        self.metadata
            .get(META_SCORE_EXPLANATION)
            .and_then(Value::as_str)
    }

    /// Whether the node carries a non-empty response.
    pub fn has_response(&self) -> bool {
        self.response.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Copy of this node marked stale at `now`.
    pub fn staled(&self, now: u64) -> Node {
        let mut node = self.clone();
        node.status = NodeStatus::Stale;
        node.updated_at = now;
        node
    }
}

/// A materialized parent→child dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub created_at: u64,
}

impl Edge {
    /// New edge with a random ID stamped now.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            created_at: now_millis(),
        }
    }

    /// Edge with an explicit ID.
    pub fn with_id(
        id: impl Into<String>,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            created_at: 0,
        }
    }

    /// Deterministic edge for a `parent_ids` entry.
    pub fn for_parent(parent: &str, child: &str, created_at: u64) -> Self {
        Self {
            id: format!("{parent}->{child}"),
            source: parent.to_string(),
            target: child.to_string(),
            created_at,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }

    pub fn connects(&self, source: &str, target: &str) -> bool {
        self.source == source && self.target == target
    }
}

/// Build a node map from a list of nodes and derive `children_ids`.
pub fn node_map<I>(nodes: I) -> NodeMap
where
    I: IntoIterator<Item = Node>,
{
    let mut map: NodeMap = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    rebuild_children(&mut map);
    map
}

/// Recompute every node's `children_ids` from the `parent_ids` of the map.
///
/// Parents missing from the map are ignored; children are listed in map order.
pub fn rebuild_children(nodes: &mut NodeMap) {
    let mut links: Vec<(NodeId, NodeId)> = Vec::new();
    for node in nodes.values() {
        let mut seen = HashSet::new();
        for parent in &node.parent_ids {
            if parent != &node.id && seen.insert(parent.as_str()) {
                links.push((parent.clone(), node.id.clone()));
            }
        }
    }

    for node in nodes.values_mut() {
        node.children_ids.clear();
    }
    for (parent, child) in links {
        if let Some(p) = nodes.get_mut(&parent) {
            p.children_ids.push(child);
        }
    }
}

/// A point-in-time copy of a project's graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: NodeMap,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            nodes: node_map(nodes),
            edges,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges.iter().any(|e| e.connects(source, target))
    }

    /// Edges plus any `parent_ids` links not yet materialized as edges.
    pub fn dependency_edges(&self) -> Vec<Edge> {
        let mut edges = self.edges.clone();
        let mut known: HashSet<(String, String)> = self
            .edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        for node in self.nodes.values() {
            for parent in &node.parent_ids {
                if known.insert((parent.clone(), node.id.clone())) {
                    edges.push(Edge::for_parent(parent, &node.id, node.updated_at));
                }
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_serde_camel_case() {
        let node = Node::new("a", "why?")
            .with_parents(["p"])
            .with_meta(META_ROLE, "source")
            .with_updated_at(42);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["parentIds"][0], "p");
        assert_eq!(json["updatedAt"], 42);
        assert_eq!(json["status"], "idle");
        assert!(json.get("response").is_none());
    }

    #[test]
    fn test_node_deserialize_defaults() {
        let node: Node = serde_json::from_str(r#"{"id":"x","prompt":"hi"}"#).unwrap();
        assert_eq!(node.status, NodeStatus::Idle);
        assert!(node.parent_ids.is_empty());
        assert_eq!(node.position, Position::ORIGIN);
    }

    #[test]
    fn test_metadata_accessors() {
        let node = Node::new("a", "p")
            .with_meta(META_PINNED, true)
            .with_meta(META_ROLE, "plan")
            .with_meta(META_SCORE_EXPLANATION, "user picked");
        assert!(node.is_pinned());
        assert_eq!(node.role(), Some("plan"));
        assert_eq!(node.score_explanation(), Some("user picked"));
        assert!(!Node::new("b", "p").is_pinned());
    }

    #[test]
    fn test_rebuild_children() {
        let map = node_map(vec![
            Node::new("a", "root"),
            Node::new("b", "b").with_parents(["a"]),
            Node::new("c", "c").with_parents(["a", "b", "a"]),
            Node::new("d", "d").with_parents(["missing"]),
        ]);
        assert_eq!(map["a"].children_ids, vec!["b", "c"]);
        assert_eq!(map["b"].children_ids, vec!["c"]);
        assert!(map["d"].children_ids.is_empty());
    }

    #[test]
    fn test_rebuild_children_ignores_input_children() {
        let mut stale = Node::new("a", "root");
        stale.children_ids = vec!["ghost".into()];
        let map = node_map(vec![stale]);
        assert!(map["a"].children_ids.is_empty());
    }

    #[test]
    fn test_staled_copy() {
        let node = Node::new("a", "p").with_response("r");
        let stale = node.staled(99);
        assert_eq!(stale.status, NodeStatus::Stale);
        assert_eq!(stale.updated_at, 99);
        assert_eq!(node.status, NodeStatus::Idle);
    }

    #[test]
    fn test_dependency_edges_merges_parent_links() {
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("a", "a"),
                Node::new("b", "b").with_parents(["a"]),
                Node::new("c", "c").with_parents(["b"]),
            ],
            vec![Edge::with_id("e1", "a", "b")],
        );
        let edges = snapshot.dependency_edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().any(|e| e.connects("b", "c")));
        assert!(snapshot.has_edge("a", "b"));
        assert!(!snapshot.has_edge("b", "c"));
    }

    #[test]
    fn test_has_response() {
        assert!(!Node::new("a", "p").has_response());
        assert!(!Node::new("a", "p").with_response("  ").has_response());
        assert!(Node::new("a", "p").with_response("ok").has_response());
    }
}
