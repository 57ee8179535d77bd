//! Persistence collaborator.
//!
//! The gateway awaits every write before broadcasting, so whatever a peer
//! receives has already been committed here.
//!
//! A stored edge and a `parent_ids` entry are two views of the same link:
//! writing either one keeps the other in step. Every node write also bumps
//! `updated_at` past the stored value, so it doubles as a per-node version
//! for [`GraphStore::update_node_if`].

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use weave_core::{rebuild_children, Edge, GraphSnapshot, Node, NodeMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unique-ID or unique-pair violation.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn has_project_access(&self, project_id: &str, user_id: &str) -> Result<bool, StoreError>;

    /// Every node and edge of a project. Unknown projects are empty.
    async fn load_graph(&self, project_id: &str) -> Result<GraphSnapshot, StoreError>;

    async fn get_node(&self, project_id: &str, node_id: &str) -> Result<Option<Node>, StoreError>;

    /// Insert a node. An existing ID is a [`StoreError::Conflict`].
    async fn create_node(&self, project_id: &str, node: Node) -> Result<Node, StoreError>;

    /// Replace a stored node. Edges follow any change to its parents.
    async fn update_node(&self, project_id: &str, node: Node) -> Result<Node, StoreError>;

    /// Replace a stored node only if its `updated_at` still equals
    /// `expected_updated_at`; otherwise [`StoreError::Conflict`].
    async fn update_node_if(
        &self,
        project_id: &str,
        node: Node,
        expected_updated_at: u64,
    ) -> Result<Node, StoreError>;

    /// Remove a node with its incident edges and any parent links to it.
    async fn delete_node(&self, project_id: &str, node_id: &str) -> Result<Node, StoreError>;

    /// Insert an edge and add its source to the target's parents. A reused
    /// ID or an existing source/target pair is a [`StoreError::Conflict`]; a
    /// missing endpoint is [`StoreError::NotFound`].
    async fn create_edge(&self, project_id: &str, edge: Edge) -> Result<Edge, StoreError>;

    /// Remove an edge and drop its source from the target's parents.
    async fn delete_edge(&self, project_id: &str, edge_id: &str) -> Result<Edge, StoreError>;
}

#[derive(Debug, Default)]
struct ProjectGraph {
    nodes: NodeMap,
    edges: Vec<Edge>,
}

impl ProjectGraph {
    /// Make the edges into `node_id` match its parent list.
    fn sync_parent_edges(&mut self, node_id: &str) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        let created_at = node.updated_at;
        let parents: Vec<String> = node
            .parent_ids
            .iter()
            .filter(|p| p.as_str() != node_id && self.nodes.contains_key(p.as_str()))
            .cloned()
            .collect();

        self.edges
            .retain(|e| e.target != node_id || parents.contains(&e.source));
        for parent in &parents {
            if self.edges.iter().any(|e| e.connects(parent, node_id)) {
                continue;
            }
            let mut edge = Edge::for_parent(parent, node_id, created_at);
            if self.edges.iter().any(|e| e.id == edge.id) {
                edge = Edge::new(parent.as_str(), node_id);
                edge.created_at = created_at;
            }
            self.edges.push(edge);
        }
    }

    /// Add `parent` to the parents of `child` if both exist and the link is missing.
    fn link_parent(&mut self, parent: &str, child: &str) {
        if parent == child || !self.nodes.contains_key(parent) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(child) {
            if !node.parent_ids.iter().any(|p| p == parent) {
                node.parent_ids.push(parent.to_string());
            }
        }
    }

    /// Store `node` over an existing entry, keeping `updated_at` increasing.
    fn replace_node(&mut self, mut node: Node) -> Result<Node, StoreError> {
        let previous = self
            .nodes
            .get(&node.id)
            .map(|n| n.updated_at)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node.id)))?;
        node.updated_at = node.updated_at.max(previous + 1);
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.sync_parent_edges(&id);
        rebuild_children(&mut self.nodes);
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id))
    }
}

/// In-process store shared by every connection of an instance (or, behind an
/// `Arc`, by several instances in tests).
#[derive(Clone)]
pub struct MemoryStore {
    projects: Arc<RwLock<HashMap<String, ProjectGraph>>>,
    grants: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    open_access: bool,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Store where only explicitly granted users may join a project.
    pub fn new() -> Self {
        Self::with_access(false)
    }

    /// Store where every authenticated user may join every project.
    pub fn open() -> Self {
        Self::with_access(true)
    }

    fn with_access(open_access: bool) -> Self {
        Self {
            projects: Arc::new(RwLock::new(HashMap::new())),
            grants: Arc::new(RwLock::new(HashMap::new())),
            open_access,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn grant(&self, project_id: &str, user_id: &str) {
        self.grants
            .write()
            .await
            .entry(project_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Load nodes and edges into a project without validation. Edges and
    /// parent lists are merged so each link appears in both.
    pub async fn seed(&self, project_id: &str, nodes: Vec<Node>, edges: Vec<Edge>) {
        let mut projects = self.projects.write().await;
        let graph = projects.entry(project_id.to_string()).or_default();
        for node in nodes {
            graph.nodes.insert(node.id.clone(), node);
        }
        for edge in &edges {
            graph.link_parent(&edge.source, &edge.target);
        }
        graph.edges.extend(edges);
        let ids: Vec<String> = graph.nodes.keys().cloned().collect();
        for id in &ids {
            graph.sync_parent_edges(id);
        }
        rebuild_children(&mut graph.nodes);
    }

    /// Toggle simulated outages. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn has_project_access(&self, project_id: &str, user_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        if self.open_access {
            return Ok(true);
        }
        Ok(self
            .grants
            .read()
            .await
            .get(project_id)
            .is_some_and(|users| users.contains(user_id)))
    }

    async fn load_graph(&self, project_id: &str) -> Result<GraphSnapshot, StoreError> {
        self.check_available()?;
        let projects = self.projects.read().await;
        Ok(projects
            .get(project_id)
            .map(|g| GraphSnapshot {
                nodes: g.nodes.clone(),
                edges: g.edges.clone(),
            })
            .unwrap_or_default())
    }

    async fn get_node(&self, project_id: &str, node_id: &str) -> Result<Option<Node>, StoreError> {
        self.check_available()?;
        let projects = self.projects.read().await;
        Ok(projects
            .get(project_id)
            .and_then(|g| g.nodes.get(node_id))
            .cloned())
    }

    async fn create_node(&self, project_id: &str, node: Node) -> Result<Node, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects.entry(project_id.to_string()).or_default();
        if graph.nodes.contains_key(&node.id) {
            return Err(StoreError::Conflict(format!("node {} already exists", node.id)));
        }
        let id = node.id.clone();
        graph.nodes.insert(id.clone(), node);
        graph.sync_parent_edges(&id);
        rebuild_children(&mut graph.nodes);
        graph
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id))
    }

    async fn update_node(&self, project_id: &str, node: Node) -> Result<Node, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node.id)))?;
        graph.replace_node(node)
    }

    async fn update_node_if(
        &self,
        project_id: &str,
        node: Node,
        expected_updated_at: u64,
    ) -> Result<Node, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node.id)))?;
        let current = graph
            .nodes
            .get(&node.id)
            .map(|n| n.updated_at)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node.id)))?;
        if current != expected_updated_at {
            return Err(StoreError::Conflict(format!(
                "node {} changed since version {expected_updated_at}",
                node.id
            )));
        }
        graph.replace_node(node)
    }

    async fn delete_node(&self, project_id: &str, node_id: &str) -> Result<Node, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        let removed = graph
            .nodes
            .remove(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        graph
            .edges
            .retain(|e| e.source != node_id && e.target != node_id);
        for node in graph.nodes.values_mut() {
            node.parent_ids.retain(|p| p != node_id);
        }
        rebuild_children(&mut graph.nodes);
        Ok(removed)
    }

    async fn create_edge(&self, project_id: &str, edge: Edge) -> Result<Edge, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects.entry(project_id.to_string()).or_default();
        for endpoint in [&edge.source, &edge.target] {
            if !graph.nodes.contains_key(endpoint) {
                return Err(StoreError::NotFound(format!("node {endpoint}")));
            }
        }
        if graph.edges.iter().any(|e| e.id == edge.id) {
            return Err(StoreError::Conflict(format!("edge {} already exists", edge.id)));
        }
        if graph.edges.iter().any(|e| e.connects(&edge.source, &edge.target)) {
            return Err(StoreError::Conflict(format!(
                "edge {} -> {} already exists",
                edge.source, edge.target
            )));
        }
        graph.link_parent(&edge.source, &edge.target);
        graph.edges.push(edge.clone());
        rebuild_children(&mut graph.nodes);
        Ok(edge)
    }

    async fn delete_edge(&self, project_id: &str, edge_id: &str) -> Result<Edge, StoreError> {
        self.check_available()?;
        let mut projects = self.projects.write().await;
        let graph = projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("edge {edge_id}")))?;
        let index = graph
            .edges
            .iter()
            .position(|e| e.id == edge_id)
            .ok_or_else(|| StoreError::NotFound(format!("edge {edge_id}")))?;
        let removed = graph.edges.remove(index);
        if let Some(target) = graph.nodes.get_mut(&removed.target) {
            target.parent_ids.retain(|p| p != &removed.source);
        }
        rebuild_children(&mut graph.nodes);
        Ok(removed)
    }
}
