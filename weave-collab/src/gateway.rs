//! Per-connection request handling for project rooms.
//!
//! ```text
//!  socket ──text──► handle_text ──► GraphStore (awaited)
//!                        │
//!                        ├──► outbox (ack / error / users:current / pong)
//!                        └──► FanoutBridge ──► BroadcastGroup ──► forwarder ──► outbox
//! ```
//!
//! Every mutation is committed before it is broadcast. Broadcasts exclude the
//! originating socket; the origin learns the outcome from its `ack`. Staleness
//! follow-ups derived by the server go to every member, origin included.

use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use weave_core::{
    cycle_with_edge, now_millis, stale_dependents, validate_node, validate_node_connection, CycleError,
    Edge, GraphSnapshot, IssueKind, Node, NodeId, NodeMap, Position, ValidationConfig, ValidationError,
};
use weave_layout::{calculate_node_position, find_non_colliding_position};

use crate::auth::Identity;
use crate::broadcast::{BroadcastGroup, Delivery, RoomManager};
use crate::fanout::FanoutBridge;
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::protocol::{
    BroadcastEnvelope, ClientFrame, ClientMessage, EventKind, NodeInput, NodePatch, ProtocolError,
    ServerFrame, EVENT_PONG,
};
use crate::store::{GraphStore, StoreError};

/// Conditional node writes retried this many times before giving up.
const WRITE_ATTEMPTS: usize = 8;

/// Failure of a single request, reported to the requesting socket only.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire code carried by the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cycle(_) => "cycle",
            Self::Validation(_) | Self::BadRequest(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(m) => Self::Conflict(m),
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::Unavailable(m) => Self::Unavailable(m),
        }
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(e: ProtocolError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Server side of one authenticated socket.
pub struct Connection {
    socket_id: String,
    identity: Identity,
    outbox: mpsc::Sender<String>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Rooms this connection currently forwards.
    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.forwarders.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    async fn push(&self, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => {
                if self.outbox.send(text).await.is_err() {
                    log::debug!("Outbox of {} closed, dropping {}", self.socket_id, frame.event);
                }
            }
            Err(e) => log::error!("Failed to encode {} frame: {e}", frame.event),
        }
    }
}

pub struct SyncGateway {
    store: Arc<dyn GraphStore>,
    presence: PresenceRegistry,
    rooms: Arc<RoomManager>,
    fanout: Arc<FanoutBridge>,
    validation: ValidationConfig,
    outbox_capacity: usize,
}

impl SyncGateway {
    pub fn new(
        store: Arc<dyn GraphStore>,
        rooms: Arc<RoomManager>,
        fanout: Arc<FanoutBridge>,
        validation: ValidationConfig,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            store,
            presence: PresenceRegistry::new(),
            rooms,
            fanout,
            validation,
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Register an authenticated socket. The receiver yields its outgoing
    /// text frames.
    pub fn connect(&self, identity: Identity) -> (Connection, mpsc::Receiver<String>) {
        let (outbox, rx) = mpsc::channel(self.outbox_capacity);
        let connection = Connection {
            socket_id: Uuid::new_v4().to_string(),
            identity,
            outbox,
            forwarders: HashMap::new(),
        };
        log::info!(
            "Socket {} authenticated as {}",
            connection.socket_id,
            connection.identity.user_id
        );
        (connection, rx)
    }

    /// Handle one text frame. Failures become an `error` frame to `conn`.
    pub async fn handle_text(&self, conn: &mut Connection, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                let request_id = serde_json::from_str::<Value>(text).ok().and_then(|v| {
                    v.get("requestId")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                let error = GatewayError::BadRequest(e.to_string());
                self.send_error(conn, &error, request_id.as_deref()).await;
                return;
            }
        };

        let ClientFrame { request_id, message } = frame;
        let name = message.name();
        if matches!(message, ClientMessage::CursorMove { .. }) {
            log::trace!("{name} from {}", conn.socket_id);
        } else {
            log::debug!("{name} from {}", conn.socket_id);
        }

        if let Err(e) = self.dispatch(conn, request_id.as_deref(), message).await {
            log::debug!("{name} from {} failed: {e}", conn.socket_id);
            self.send_error(conn, &e, request_id.as_deref()).await;
        }
    }

    async fn dispatch(
        &self,
        conn: &mut Connection,
        request_id: Option<&str>,
        message: ClientMessage,
    ) -> Result<(), GatewayError> {
        match message {
            ClientMessage::JoinProject { project_id } => self.join(conn, request_id, &project_id).await,
            ClientMessage::LeaveProject { project_id } => self.leave(conn, request_id, &project_id).await,
            ClientMessage::CursorMove {
                project_id,
                x,
                y,
                node_id,
            } => self.move_cursor(conn, request_id, &project_id, x, y, node_id).await,
            ClientMessage::NodeCreate { project_id, node } => {
                self.create_node(conn, request_id, &project_id, node).await
            }
            ClientMessage::NodeUpdate {
                project_id,
                node_id,
                changes,
            } => {
                self.update_node(conn, request_id, &project_id, &node_id, changes)
                    .await
            }
            ClientMessage::NodeDelete {
                project_id,
                node_id,
            } => self.delete_node(conn, request_id, &project_id, &node_id).await,
            ClientMessage::EdgeCreate {
                project_id,
                source,
                target,
                id,
            } => {
                self.create_edge(conn, request_id, &project_id, source, target, id)
                    .await
            }
            ClientMessage::EdgeDelete {
                project_id,
                edge_id,
            } => self.delete_edge(conn, request_id, &project_id, &edge_id).await,
            ClientMessage::Ping {} => {
                self.ping(conn, request_id).await;
                Ok(())
            }
        }
    }

    // ── Rooms ──────────────────────────────────────────────────────

    async fn join(
        &self,
        conn: &mut Connection,
        request_id: Option<&str>,
        project_id: &str,
    ) -> Result<(), GatewayError> {
        if !self
            .store
            .has_project_access(project_id, &conn.identity.user_id)
            .await?
        {
            return Err(GatewayError::Unauthorized(format!(
                "no access to project {project_id}"
            )));
        }

        let entry = PresenceEntry::new(conn.socket_id.clone(), &conn.identity, now_millis());
        let newly_joined = self.presence.join(project_id, entry.clone()).await;
        if newly_joined {
            let (group, rx) = self.rooms.join(project_id, &conn.socket_id).await;
            let handle = spawn_forwarder(
                project_id.to_string(),
                conn.socket_id.clone(),
                rx,
                conn.outbox.clone(),
                group,
            );
            conn.forwarders.insert(project_id.to_string(), handle);
            log::info!("Socket {} joined project {project_id}", conn.socket_id);
        }

        let users = self.presence.roster(project_id, Some(&conn.socket_id)).await;
        let roster = json!({ "projectId": project_id, "users": users });
        self.send_event(conn, EventKind::UsersCurrent, &roster).await;

        if newly_joined {
            self.emit(
                project_id,
                EventKind::UserJoined,
                presence_payload(project_id, &entry),
                Some(&conn.socket_id),
            )
            .await?;
        }
        self.ack(conn, request_id, roster).await;
        Ok(())
    }

    async fn leave(
        &self,
        conn: &mut Connection,
        request_id: Option<&str>,
        project_id: &str,
    ) -> Result<(), GatewayError> {
        let Some(entry) = self.presence.leave(project_id, &conn.socket_id).await else {
            self.ack(conn, request_id, json!({ "projectId": project_id, "left": false }))
                .await;
            return Ok(());
        };
        if let Some(handle) = conn.forwarders.remove(project_id) {
            handle.abort();
        }
        self.release_member(project_id, &conn.socket_id).await;
        log::info!("Socket {} left project {project_id}", conn.socket_id);

        self.emit(
            project_id,
            EventKind::UserLeft,
            presence_payload(project_id, &entry),
            Some(&conn.socket_id),
        )
        .await?;
        self.ack(conn, request_id, json!({ "projectId": project_id, "left": true }))
            .await;
        Ok(())
    }

    /// Tear down every room membership of a closed socket. Never fails.
    pub async fn disconnect(&self, mut conn: Connection) {
        for (_, handle) in conn.forwarders.drain() {
            handle.abort();
        }
        let removed = self.presence.remove_connection(&conn.socket_id).await;
        for (room, entry) in removed {
            self.release_member(&room, &conn.socket_id).await;
            if let Err(e) = self
                .emit(
                    &room,
                    EventKind::UserLeft,
                    presence_payload(&room, &entry),
                    Some(&conn.socket_id),
                )
                .await
            {
                log::warn!("Failed to announce departure of {} from {room}: {e}", conn.socket_id);
            }
        }
        log::info!("Socket {} disconnected", conn.socket_id);
    }

    async fn release_member(&self, room: &str, socket_id: &str) {
        if let Some(group) = self.rooms.get(room).await {
            group.remove_member(socket_id).await;
        }
        self.rooms.remove_if_empty(room).await;
    }

    async fn require_member(&self, conn: &Connection, project_id: &str) -> Result<(), GatewayError> {
        if self.presence.is_member(project_id, &conn.socket_id).await {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized(format!(
                "not joined to project {project_id}"
            )))
        }
    }

    // ── Presence ───────────────────────────────────────────────────

    async fn move_cursor(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        x: f64,
        y: f64,
        node_id: Option<String>,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        let mut data = json!({
            "projectId": project_id,
            "userId": conn.identity.user_id,
            "username": conn.identity.username,
            "socketId": conn.socket_id,
            "x": x,
            "y": y,
        });
        if let (Some(node_id), Some(obj)) = (node_id, data.as_object_mut()) {
            obj.insert("nodeId".into(), Value::String(node_id));
        }
        self.emit(project_id, EventKind::CursorMoved, data, Some(&conn.socket_id))
            .await?;
        self.ack(conn, request_id, json!({ "projectId": project_id }))
            .await;
        Ok(())
    }

    async fn ping(&self, conn: &Connection, request_id: Option<&str>) {
        for room in self.presence.rooms_of(&conn.socket_id).await {
            let users = self.presence.roster(&room, Some(&conn.socket_id)).await;
            let roster = json!({ "projectId": room, "users": users });
            self.send_event(conn, EventKind::UsersCurrent, &roster).await;
        }
        let mut data = json!({ "at": now_millis() });
        if let (Some(id), Some(obj)) = (request_id, data.as_object_mut()) {
            obj.insert("requestId".into(), Value::String(id.to_string()));
        }
        conn.push(&ServerFrame::new(EVENT_PONG, data)).await;
    }

    // ── Nodes ──────────────────────────────────────────────────────

    async fn create_node(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        input: NodeInput,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        let requested_position = input.position;
        let mut node = node_from_input(input, now_millis());
        log_warnings(&validate_node(&node).into_result()?);

        let snapshot = self.store.load_graph(project_id).await?;
        if let Some(existing) = snapshot.node(&node.id) {
            return self
                .reply_existing(conn, request_id, project_id, existing.clone())
                .await;
        }
        self.gate_parents(&node, &[], &snapshot)?;
        node.position = requested_position.unwrap_or_else(|| place_node(&node, &snapshot));

        let stored = match self.store.create_node(project_id, node.clone()).await {
            Ok(stored) => stored,
            Err(StoreError::Conflict(reason)) => {
                // Lost a race with a concurrent create of the same ID.
                let existing = self
                    .store
                    .get_node(project_id, &node.id)
                    .await?
                    .ok_or(GatewayError::Conflict(reason))?;
                return self
                    .reply_existing(conn, request_id, project_id, existing)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        let payload = json!({ "projectId": project_id, "node": stored });
        self.emit(
            project_id,
            EventKind::NodeCreated,
            payload.clone(),
            Some(&conn.socket_id),
        )
        .await?;
        self.ack(conn, request_id, payload).await;
        Ok(())
    }

    /// Answer a create whose ID is already taken with the stored node.
    async fn reply_existing(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        existing: Node,
    ) -> Result<(), GatewayError> {
        log::debug!("Node {} already exists in {project_id}", existing.id);
        let payload = json!({ "projectId": project_id, "node": existing, "alreadyExists": true });
        match request_id {
            Some(id) => conn.push(&ServerFrame::ack(id, payload)).await,
            None => self.send_event(conn, EventKind::NodeCreated, &payload).await,
        }
        Ok(())
    }

    async fn update_node(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        node_id: &str,
        changes: NodePatch,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        let content_changed = changes.changes_content();

        // Conditional on the version read; a conflict re-reads and re-patches.
        let mut attempt = 0;
        let stored = loop {
            attempt += 1;
            let existing = self
                .store
                .get_node(project_id, node_id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("node {node_id}")))?;

            let mut node = existing.clone();
            apply_patch(&mut node, changes.clone(), now_millis());
            log_warnings(&validate_node(&node).into_result()?);

            if node.parent_ids != existing.parent_ids {
                let snapshot = self.store.load_graph(project_id).await?;
                self.gate_parents(&node, &existing.parent_ids, &snapshot)?;
            }

            match self
                .store
                .update_node_if(project_id, node, existing.updated_at)
                .await
            {
                Ok(stored) => break stored,
                Err(StoreError::Conflict(reason)) if attempt < WRITE_ATTEMPTS => {
                    log::debug!("Retrying update of {node_id} in {project_id}: {reason}");
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.emit(
            project_id,
            EventKind::NodeUpdated,
            json!({ "projectId": project_id, "node": stored }),
            Some(&conn.socket_id),
        )
        .await?;

        let staled = if content_changed {
            self.cascade_stale(project_id, node_id).await?
        } else {
            Vec::new()
        };
        self.ack(
            conn,
            request_id,
            json!({ "projectId": project_id, "node": stored, "staled": staled }),
        )
        .await;
        Ok(())
    }

    async fn delete_node(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        node_id: &str,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        if self.store.get_node(project_id, node_id).await?.is_none() {
            return Err(GatewayError::NotFound(format!("node {node_id}")));
        }

        let staled = self.cascade_stale(project_id, node_id).await?;
        self.store.delete_node(project_id, node_id).await?;
        self.emit(
            project_id,
            EventKind::NodeDeleted,
            json!({ "projectId": project_id, "nodeId": node_id }),
            Some(&conn.socket_id),
        )
        .await?;
        self.ack(
            conn,
            request_id,
            json!({ "projectId": project_id, "nodeId": node_id, "staled": staled }),
        )
        .await;
        Ok(())
    }

    /// Persist and broadcast the stale copy of every dependent of `node_id`.
    async fn cascade_stale(&self, project_id: &str, node_id: &str) -> Result<Vec<NodeId>, GatewayError> {
        let snapshot = self.store.load_graph(project_id).await?;
        let edges = snapshot.dependency_edges();
        let dependents = stale_dependents(node_id, &snapshot.nodes, &edges, now_millis());

        let mut staled = Vec::with_capacity(dependents.len());
        for node in dependents {
            let expected = snapshot
                .node(&node.id)
                .map_or(node.updated_at, |n| n.updated_at);
            let Some(stored) = self.write_stale(project_id, node, expected).await? else {
                continue;
            };
            self.emit(
                project_id,
                EventKind::NodeUpdated,
                json!({ "projectId": project_id, "node": stored }),
                None,
            )
            .await?;
            staled.push(stored.id);
        }
        if !staled.is_empty() {
            log::debug!("Change to {node_id} staled {} node(s)", staled.len());
        }
        Ok(staled)
    }

    /// Store a stale copy, re-marking the latest version if the node moved on.
    /// `None` when the node was deleted meanwhile.
    async fn write_stale(
        &self,
        project_id: &str,
        mut node: Node,
        mut expected: u64,
    ) -> Result<Option<Node>, GatewayError> {
        let id = node.id.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.update_node_if(project_id, node, expected).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(StoreError::Conflict(reason)) if attempt < WRITE_ATTEMPTS => {
                    log::debug!("Retrying stale mark of {id}: {reason}");
                    let Some(fresh) = self.store.get_node(project_id, &id).await? else {
                        return Ok(None);
                    };
                    expected = fresh.updated_at;
                    node = fresh.staled(now_millis());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Check the parent links of `node` against the rest of the graph.
    ///
    /// Links the node already had (`previous_parents`) are replaced, not added.
    fn gate_parents(
        &self,
        node: &Node,
        previous_parents: &[NodeId],
        snapshot: &GraphSnapshot,
    ) -> Result<(), GatewayError> {
        let mut nodes = snapshot.nodes.clone();
        nodes.insert(node.id.clone(), node.clone());

        let mut planned: Vec<Edge> = snapshot
            .dependency_edges()
            .into_iter()
            .filter(|e| !(e.target == node.id && previous_parents.contains(&e.source)))
            .collect();

        let unique: BTreeSet<&str> = node.parent_ids.iter().map(String::as_str).collect();
        for parent in unique {
            if planned.iter().any(|e| e.connects(parent, &node.id)) {
                continue;
            }
            self.check_connection(parent, &node.id, &nodes, &planned)?;
            planned.push(Edge::for_parent(parent, &node.id, node.updated_at));
        }
        Ok(())
    }

    /// Reject a `source → target` dependency that is invalid or closes a cycle.
    fn check_connection(
        &self,
        source: &str,
        target: &str,
        nodes: &NodeMap,
        edges: &[Edge],
    ) -> Result<(), GatewayError> {
        let report = validate_node_connection(source, target, nodes, edges, &self.validation);
        let only_cycle = report
            .errors
            .iter()
            .all(|issue| issue.kind == IssueKind::WouldCreateCycle);
        if only_cycle && source != target {
            if let Some(cycle) = cycle_with_edge(source, target, edges) {
                return Err(CycleError::new(cycle).into());
            }
        }
        log_warnings(&report.into_result()?);
        Ok(())
    }

    // ── Edges ──────────────────────────────────────────────────────

    async fn create_edge(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        source: String,
        target: String,
        id: Option<String>,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        let snapshot = self.store.load_graph(project_id).await?;
        self.check_connection(&source, &target, &snapshot.nodes, &snapshot.dependency_edges())?;

        let mut edge = match id {
            Some(id) => Edge::with_id(id, source, target),
            None => Edge::new(source, target),
        };
        edge.created_at = now_millis();
        let stored = self.store.create_edge(project_id, edge).await?;

        let payload = json!({ "projectId": project_id, "edge": stored });
        self.emit(
            project_id,
            EventKind::EdgeCreated,
            payload.clone(),
            Some(&conn.socket_id),
        )
        .await?;
        let ack = self
            .announce_target(conn, project_id, &stored.target, payload)
            .await?;
        self.ack(conn, request_id, ack).await;
        Ok(())
    }

    async fn delete_edge(
        &self,
        conn: &Connection,
        request_id: Option<&str>,
        project_id: &str,
        edge_id: &str,
    ) -> Result<(), GatewayError> {
        self.require_member(conn, project_id).await?;
        let removed = self.store.delete_edge(project_id, edge_id).await?;
        let payload = json!({ "projectId": project_id, "edgeId": edge_id, "edge": removed });
        self.emit(
            project_id,
            EventKind::EdgeDeleted,
            payload.clone(),
            Some(&conn.socket_id),
        )
        .await?;
        let ack = self
            .announce_target(conn, project_id, &removed.target, payload)
            .await?;
        self.ack(conn, request_id, ack).await;
        Ok(())
    }

    /// Broadcast the target of a changed edge, whose parents moved with it,
    /// and add it to the origin's ack payload.
    async fn announce_target(
        &self,
        conn: &Connection,
        project_id: &str,
        target_id: &str,
        mut ack: Value,
    ) -> Result<Value, GatewayError> {
        let Some(target) = self.store.get_node(project_id, target_id).await? else {
            return Ok(ack);
        };
        let node = serde_json::to_value(&target).map_err(|e| GatewayError::Internal(e.to_string()))?;
        self.emit(
            project_id,
            EventKind::NodeUpdated,
            json!({ "projectId": project_id, "node": node }),
            Some(&conn.socket_id),
        )
        .await?;
        if let Some(obj) = ack.as_object_mut() {
            obj.insert("node".into(), node);
        }
        Ok(ack)
    }

    // ── Output ─────────────────────────────────────────────────────

    async fn emit(
        &self,
        room: &str,
        kind: EventKind,
        data: Value,
        exclude: Option<&str>,
    ) -> Result<(), GatewayError> {
        let envelope = BroadcastEnvelope::new(room, kind, &data, exclude.map(str::to_string))?;
        self.fanout.emit(envelope).await;
        Ok(())
    }

    /// Event sent to one socket only, under every emitted name.
    async fn send_event(&self, conn: &Connection, kind: EventKind, data: &Value) {
        for frame in ServerFrame::for_event(kind, data, self.fanout.emit_legacy_aliases()) {
            conn.push(&frame).await;
        }
    }

    async fn ack(&self, conn: &Connection, request_id: Option<&str>, data: Value) {
        if let Some(id) = request_id {
            conn.push(&ServerFrame::ack(id, data)).await;
        }
    }

    async fn send_error(&self, conn: &Connection, error: &GatewayError, request_id: Option<&str>) {
        let frame = ServerFrame::error(error.code(), &error.to_string(), request_id);
        conn.push(&frame).await;
    }
}

/// Move room deliveries for `socket_id` into its outbox until aborted.
fn spawn_forwarder(
    room: String,
    socket_id: String,
    mut rx: broadcast::Receiver<Arc<Delivery>>,
    outbox: mpsc::Sender<String>,
    group: Arc<BroadcastGroup>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delivery) => {
                    if !delivery.is_for(&socket_id) {
                        continue;
                    }
                    for frame in &delivery.frames {
                        if outbox.send(frame.clone()).await.is_err() {
                            return;
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    group.record_lag(missed);
                    log::warn!("Socket {socket_id} lagged in room {room}, dropped {missed} event(s)");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn presence_payload(project_id: &str, entry: &PresenceEntry) -> Value {
    let mut data = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));
    if let Some(obj) = data.as_object_mut() {
        obj.insert("projectId".into(), Value::String(project_id.to_string()));
    }
    data
}

fn node_from_input(input: NodeInput, now: u64) -> Node {
    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut node = Node::new(id, input.prompt)
        .with_parents(input.parent_ids)
        .with_updated_at(now);
    node.response = input.response;
    node.summary = input.summary;
    node.status = input.status.unwrap_or_default();
    node.metadata = input.metadata;
    node
}

/// Overlay a patch. Metadata keys merge; a `null` value removes the key.
fn apply_patch(node: &mut Node, patch: NodePatch, now: u64) {
    if let Some(prompt) = patch.prompt {
        node.prompt = prompt;
    }
    if let Some(response) = patch.response {
        node.response = Some(response);
    }
    if let Some(summary) = patch.summary {
        node.summary = Some(summary);
    }
    if let Some(status) = patch.status {
        node.status = status;
    }
    if let Some(position) = patch.position {
        node.position = position;
    }
    if let Some(parent_ids) = patch.parent_ids {
        node.parent_ids = parent_ids;
    }
    if let Some(metadata) = patch.metadata {
        merge_metadata(&mut node.metadata, metadata);
    }
    node.updated_at = now;
}

fn merge_metadata(target: &mut Map<String, Value>, changes: Map<String, Value>) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// Free canvas cell under the node's parents.
fn place_node(node: &Node, snapshot: &GraphSnapshot) -> Position {
    let parents: Vec<Position> = node
        .parent_ids
        .iter()
        .filter_map(|id| snapshot.node(id))
        .map(|p| p.position)
        .collect();
    let siblings: Vec<Position> = snapshot
        .nodes
        .values()
        .filter(|n| n.parent_ids.iter().any(|p| node.parent_ids.contains(p)))
        .map(|n| n.position)
        .collect();
    let occupied: Vec<Position> = snapshot.nodes.values().map(|n| n.position).collect();
    find_non_colliding_position(calculate_node_position(&parents, &siblings), &occupied)
}

fn log_warnings(report: &weave_core::ValidationReport) {
    for issue in &report.warnings {
        log::warn!("{}", issue.message);
    }
}
