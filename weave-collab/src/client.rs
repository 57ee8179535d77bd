//! WebSocket client for the sync gateway.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed request helpers that return the `requestId` to await an `ack` on
//! - Offline queue for requests issued while disconnected

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ClientFrame, ClientMessage, EventKind, NodeInput, NodePatch, ProtocolError, ServerFrame,
    EVENT_ACK, EVENT_ERROR, EVENT_PONG,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How the token travels on the upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>`
    Header,
    /// `?token=<token>`
    Query,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A room event under one of its names.
    Event {
        kind: EventKind,
        legacy: bool,
        data: Value,
    },
    Ack {
        request_id: String,
        data: Value,
    },
    Error {
        code: String,
        message: String,
        request_id: Option<String>,
    },
    Pong {
        request_id: Option<String>,
    },
}

impl SyncEvent {
    /// Classify a server frame. Unknown event names yield `None`.
    pub fn from_frame(frame: ServerFrame) -> Option<SyncEvent> {
        let str_field = |data: &Value, key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        match frame.event.as_str() {
            EVENT_ACK => Some(SyncEvent::Ack {
                request_id: str_field(&frame.data, "requestId").unwrap_or_default(),
                data: frame.data.get("data").cloned().unwrap_or(Value::Null),
            }),
            EVENT_ERROR => Some(SyncEvent::Error {
                code: str_field(&frame.data, "code").unwrap_or_default(),
                message: str_field(&frame.data, "message").unwrap_or_default(),
                request_id: str_field(&frame.data, "requestId"),
            }),
            EVENT_PONG => Some(SyncEvent::Pong {
                request_id: str_field(&frame.data, "requestId"),
            }),
            name => {
                let kind = EventKind::from_name(name)?;
                Some(SyncEvent::Event {
                    kind,
                    legacy: kind.legacy() == name,
                    data: frame.data,
                })
            }
        }
    }
}

/// Requests issued while disconnected, replayed on connect.
pub struct OfflineQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns false when full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    token: Option<String>,
    placement: TokenPlacement,

    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    next_request: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token,
            placement: TokenPlacement::Header,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            next_request: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_token_placement(mut self, placement: TokenPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn queued_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    fn url(&self) -> String {
        match (&self.token, self.placement) {
            (Some(token), TokenPlacement::Query) => {
                let sep = if self.server_url.contains('?') { '&' } else { '?' };
                format!("{}{sep}token={token}", self.server_url)
            }
            _ => self.server_url.clone(),
        }
    }

    /// Connect to the server.
    ///
    /// Spawns a writer task and a reader task. The server rejects a bad token
    /// after the upgrade, so a rejected client sees `Connected`, an `Error`
    /// with code `unauthorized`, then `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        if let (Some(token), TokenPlacement::Header) = (&self.token, self.placement) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Replay offline queue
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued request(s)", queued.len());
            }
            for text in queued {
                let _ = out_tx.send(text).await;
            }
        }
        self.outgoing_tx = Some(out_tx);

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::parse(text.as_str()) {
                        Ok(frame) => {
                            if let Some(event) = SyncEvent::from_frame(frame) {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection; the writer task sends a close frame.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a frame, or queue it while disconnected.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ProtocolError> {
        let text = frame.to_text()?;
        let connected = *self.state.read().await == ConnectionState::Connected;
        match (&self.outgoing_tx, connected) {
            (Some(tx), true) => tx
                .send(text)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            _ => {
                if self.offline_queue.lock().await.enqueue(text) {
                    Ok(())
                } else {
                    Err(ProtocolError::ConnectionClosed)
                }
            }
        }
    }

    /// Send `message` with a fresh request ID and return the ID.
    pub async fn request(&self, message: ClientMessage) -> Result<String, ProtocolError> {
        let id = format!("r{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        self.send(ClientFrame::new(message).with_request_id(id.clone()))
            .await?;
        Ok(id)
    }

    pub async fn join_project(&self, project_id: &str) -> Result<String, ProtocolError> {
        self.request(ClientMessage::JoinProject {
            project_id: project_id.to_string(),
        })
        .await
    }

    pub async fn leave_project(&self, project_id: &str) -> Result<String, ProtocolError> {
        self.request(ClientMessage::LeaveProject {
            project_id: project_id.to_string(),
        })
        .await
    }

    /// Cursor moves are fire-and-forget: no request ID, no ack.
    pub async fn move_cursor(
        &self,
        project_id: &str,
        x: f64,
        y: f64,
        node_id: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientFrame::new(ClientMessage::CursorMove {
            project_id: project_id.to_string(),
            x,
            y,
            node_id: node_id.map(str::to_string),
        }))
        .await
    }

    pub async fn create_node(&self, project_id: &str, node: NodeInput) -> Result<String, ProtocolError> {
        self.request(ClientMessage::NodeCreate {
            project_id: project_id.to_string(),
            node,
        })
        .await
    }

    pub async fn update_node(
        &self,
        project_id: &str,
        node_id: &str,
        changes: NodePatch,
    ) -> Result<String, ProtocolError> {
        self.request(ClientMessage::NodeUpdate {
            project_id: project_id.to_string(),
            node_id: node_id.to_string(),
            changes,
        })
        .await
    }

    pub async fn delete_node(&self, project_id: &str, node_id: &str) -> Result<String, ProtocolError> {
        self.request(ClientMessage::NodeDelete {
            project_id: project_id.to_string(),
            node_id: node_id.to_string(),
        })
        .await
    }

    pub async fn create_edge(
        &self,
        project_id: &str,
        source: &str,
        target: &str,
    ) -> Result<String, ProtocolError> {
        self.request(ClientMessage::EdgeCreate {
            project_id: project_id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            id: None,
        })
        .await
    }

    pub async fn delete_edge(&self, project_id: &str, edge_id: &str) -> Result<String, ProtocolError> {
        self.request(ClientMessage::EdgeDelete {
            project_id: project_id.to_string(),
            edge_id: edge_id.to_string(),
        })
        .await
    }

    pub async fn ping(&self) -> Result<String, ProtocolError> {
        self.request(ClientMessage::Ping {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue("a".into()));
        assert!(queue.enqueue("b".into()));
        assert!(!queue.enqueue("c".into()));
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_classification() {
        let legacy = SyncEvent::from_frame(ServerFrame::new("cursor-moved", json!({"x": 1})));
        assert_eq!(
            legacy,
            Some(SyncEvent::Event {
                kind: EventKind::CursorMoved,
                legacy: true,
                data: json!({"x": 1}),
            })
        );

        let ack = SyncEvent::from_frame(ServerFrame::ack("r1", json!({"ok": 1}))).unwrap();
        assert_eq!(
            ack,
            SyncEvent::Ack {
                request_id: "r1".into(),
                data: json!({"ok": 1}),
            }
        );

        let error = SyncEvent::from_frame(ServerFrame::error("cycle", "loop", None)).unwrap();
        assert!(matches!(error, SyncEvent::Error { ref code, request_id: None, .. } if code == "cycle"));
        assert_eq!(SyncEvent::from_frame(ServerFrame::new("mystery", Value::Null)), None);
    }

    #[test]
    fn test_query_token_url() {
        let client = SyncClient::new("ws://127.0.0.1:1", Some("abc".into()))
            .with_token_placement(TokenPlacement::Query);
        assert_eq!(client.url(), "ws://127.0.0.1:1?token=abc");
        let header = SyncClient::new("ws://127.0.0.1:1", Some("abc".into()));
        assert_eq!(header.url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_requests_queue_while_disconnected() {
        let client = SyncClient::new("ws://127.0.0.1:1", None);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        let first = client.join_project("p").await.unwrap();
        let second = client.ping().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(client.queued_len().await, 2);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), None);
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
