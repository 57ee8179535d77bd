//! JSON wire protocol for the real-time gateway, plus the bincode envelope
//! exchanged between instances through the broker.
//!
//! Client → server text frames are internally tagged by `event`:
//! ```text
//! {"event": "node:create", "requestId": "r1", "projectId": "p", "node": {...}}
//! ```
//! Server → client text frames always carry a `data` object:
//! ```text
//! {"event": "node:created", "data": {"projectId": "p", "node": {...}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weave_core::{NodeStatus, Position};

/// Direct reply to a request carrying a `requestId`.
pub const EVENT_ACK: &str = "ack";
/// Reply to `ping`.
pub const EVENT_PONG: &str = "pong";
/// Failure of the triggering request.
pub const EVENT_ERROR: &str = "error";

/// Client-visible broadcast events, each with a namespaced and a legacy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    UsersCurrent,
    UserJoined,
    UserLeft,
    CursorMoved,
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    EdgeCreated,
    EdgeDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::UsersCurrent,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::CursorMoved,
        EventKind::NodeCreated,
        EventKind::NodeUpdated,
        EventKind::NodeDeleted,
        EventKind::EdgeCreated,
        EventKind::EdgeDeleted,
    ];

    /// `(namespaced, legacy)` name pair.
    pub const fn names(self) -> (&'static str, &'static str) {
        match self {
            EventKind::UsersCurrent => ("users:current", "users-current"),
            EventKind::UserJoined => ("user:joined", "user-joined"),
            EventKind::UserLeft => ("user:left", "user-left"),
            EventKind::CursorMoved => ("cursor:moved", "cursor-moved"),
            EventKind::NodeCreated => ("node:created", "node-created"),
            EventKind::NodeUpdated => ("node:updated", "node-updated"),
            EventKind::NodeDeleted => ("node:deleted", "node-deleted"),
            EventKind::EdgeCreated => ("edge:created", "edge-created"),
            EventKind::EdgeDeleted => ("edge:deleted", "edge-deleted"),
        }
    }

    pub const fn namespaced(self) -> &'static str {
        self.names().0
    }

    pub const fn legacy(self) -> &'static str {
        self.names().1
    }

    /// Names to emit for one occurrence of this event.
    pub fn emitted_names(self, include_legacy: bool) -> Vec<&'static str> {
        let (namespaced, legacy) = self.names();
        if include_legacy {
            vec![namespaced, legacy]
        } else {
            vec![namespaced]
        }
    }

    /// Resolve either name form.
    pub fn from_name(name: &str) -> Option<EventKind> {
        Self::ALL
            .into_iter()
            .find(|k| k.namespaced() == name || k.legacy() == name)
    }
}

/// Node fields accepted on create. `id` is generated when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl NodeInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }
}

/// Partial node update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl NodePatch {
    /// Whether the patch touches generated content, which invalidates dependents.
    pub fn changes_content(&self) -> bool {
        self.prompt.is_some() || self.response.is_some()
    }
}

/// Request body, tagged by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "project:join", alias = "join-project")]
    JoinProject { project_id: String },
    #[serde(rename = "project:leave", alias = "leave-project")]
    LeaveProject { project_id: String },
    #[serde(rename = "cursor:move", alias = "cursor-move")]
    CursorMove {
        project_id: String,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    #[serde(rename = "node:create", alias = "node-create")]
    NodeCreate { project_id: String, node: NodeInput },
    #[serde(rename = "node:update", alias = "node-update")]
    NodeUpdate {
        project_id: String,
        node_id: String,
        changes: NodePatch,
    },
    #[serde(rename = "node:delete", alias = "node-delete")]
    NodeDelete { project_id: String, node_id: String },
    #[serde(rename = "edge:create", alias = "edge-create")]
    EdgeCreate {
        project_id: String,
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "edge:delete", alias = "edge-delete")]
    EdgeDelete { project_id: String, edge_id: String },
    #[serde(rename = "ping")]
    Ping {},
}

impl ClientMessage {
    /// Namespaced request name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinProject { .. } => "project:join",
            ClientMessage::LeaveProject { .. } => "project:leave",
            ClientMessage::CursorMove { .. } => "cursor:move",
            ClientMessage::NodeCreate { .. } => "node:create",
            ClientMessage::NodeUpdate { .. } => "node:update",
            ClientMessage::NodeDelete { .. } => "node:delete",
            ClientMessage::EdgeCreate { .. } => "edge:create",
            ClientMessage::EdgeDelete { .. } => "edge:delete",
            ClientMessage::Ping {} => "ping",
        }
    }
}

/// A full client frame: optional correlation ID plus the tagged body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientFrame {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn ack(request_id: &str, data: Value) -> Self {
        Self::new(
            EVENT_ACK,
            serde_json::json!({ "requestId": request_id, "ok": true, "data": data }),
        )
    }

    pub fn error(code: &str, message: &str, request_id: Option<&str>) -> Self {
        let mut data = serde_json::json!({ "code": code, "message": message });
        if let (Some(id), Some(obj)) = (request_id, data.as_object_mut()) {
            obj.insert("requestId".into(), Value::String(id.to_string()));
        }
        Self::new(EVENT_ERROR, data)
    }

    /// One frame per emitted name of `kind`.
    pub fn for_event(kind: EventKind, data: &Value, include_legacy: bool) -> Vec<ServerFrame> {
        kind.emitted_names(include_legacy)
            .into_iter()
            .map(|name| ServerFrame::new(name, data.clone()))
            .collect()
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_name(&self.event)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Event routed to a room, possibly through the broker.
///
/// `payload` is the JSON text of the frame's `data`, encoded once by the
/// originating instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub room: String,
    pub event: EventKind,
    pub payload: String,
    pub exclude_origin_id: Option<String>,
}

impl BroadcastEnvelope {
    pub fn new(
        room: impl Into<String>,
        event: EventKind,
        data: &Value,
        exclude_origin_id: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_string(data).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            room: room.into(),
            event,
            payload,
            exclude_origin_id,
        })
    }

    /// Serialize to the broker wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the broker wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(envelope)
    }

    /// Client text frames for this event, one per emitted name.
    pub fn render(&self, include_legacy: bool) -> Result<Vec<String>, ProtocolError> {
        let data: Value = serde_json::from_str(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        ServerFrame::for_event(self.event, &data, include_legacy)
            .iter()
            .map(ServerFrame::to_text)
            .collect()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
