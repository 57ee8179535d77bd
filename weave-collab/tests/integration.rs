//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying authentication, room membership and graph mutations.

use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use weave_collab::{
    ConnectionState, EventKind, GraphStore, Identity, MemoryStore, NodeInput, NodePatch, ServerConfig,
    ServerFrame, StaticTokenAuthenticator, SyncClient, SyncEvent, SyncServer, TokenPlacement,
};
use weave_core::{Node, NodeStatus};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn authenticator() -> Arc<StaticTokenAuthenticator> {
    Arc::new(
        StaticTokenAuthenticator::new()
            .with_token("t-alice", Identity::new("alice", "Alice"))
            .with_token("t-bob", Identity::new("bob", "Bob")),
    )
}

/// Start a server on a free port, return the port.
async fn start_test_server(store: MemoryStore, config: ServerConfig) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ..config
    };
    let server = SyncServer::new(config, Arc::new(store), authenticator());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Connect a client, draining the initial Connected event.
async fn connect_client(port: u16, token: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), Some(token.to_string()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next(&mut events).await, SyncEvent::Connected);
    (client, events)
}

async fn next(events: &mut Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Wait for the ack of `request_id`, failing on an error for it.
async fn ack(events: &mut Receiver<SyncEvent>, request_id: &str) -> Value {
    loop {
        match next(events).await {
            SyncEvent::Ack { request_id: id, data } if id == request_id => return data,
            SyncEvent::Error {
                request_id: Some(id),
                code,
                message,
            } if id == request_id => panic!("request {id} failed: {code}: {message}"),
            _ => {}
        }
    }
}

/// Namespaced events of `kind` received within `window`.
async fn collect(events: &mut Receiver<SyncEvent>, kind: EventKind, window: Duration) -> Vec<Value> {
    let deadline = Instant::now() + window;
    let mut found = Vec::new();
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(Instant::now()), events.recv()).await {
        if let SyncEvent::Event {
            kind: k,
            legacy: false,
            data,
        } = event
        {
            if k == kind {
                found.push(data);
            }
        }
    }
    found
}

async fn drain(events: &mut Receiver<SyncEvent>) {
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), events.recv()).await {}
}

async fn joined(port: u16, token: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let (client, mut events) = connect_client(port, token).await;
    let id = client.join_project("p").await.unwrap();
    ack(&mut events, &id).await;
    drain(&mut events).await;
    (client, events)
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let port = start_test_server(MemoryStore::open(), ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = first else {
        panic!("expected text frame, got {first:?}");
    };
    let frame = ServerFrame::parse(text.as_str()).unwrap();
    assert_eq!(frame.event, "error");
    assert_eq!(frame.data["code"], "unauthorized");

    // Then the server closes.
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(other)) => panic!("unexpected frame after rejection: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let port = start_test_server(MemoryStore::open(), ServerConfig::default()).await;
    let (client, mut events) = connect_client(port, "t-nobody").await;

    match next(&mut events).await {
        SyncEvent::Error { code, .. } => assert_eq!(code, "unauthorized"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(next(&mut events).await, SyncEvent::Disconnected);
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_query_token_accepted() {
    let port = start_test_server(MemoryStore::open(), ServerConfig::default()).await;
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), Some("t-bob".into()))
        .with_token_placement(TokenPlacement::Query);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let id = client.join_project("p").await.unwrap();
    let data = ack(&mut events, &id).await;
    assert_eq!(data["projectId"], "p");
}

#[tokio::test]
async fn test_join_without_access_rejected() {
    let store = MemoryStore::new();
    store.grant("p", "alice").await;
    let port = start_test_server(store, ServerConfig::default()).await;

    let (bob, mut bob_events) = connect_client(port, "t-bob").await;
    let id = bob.join_project("p").await.unwrap();
    match next(&mut bob_events).await {
        SyncEvent::Error { code, request_id, .. } => {
            assert_eq!(code, "unauthorized");
            assert_eq!(request_id.as_deref(), Some(id.as_str()));
        }
        other => panic!("expected error, got {other:?}"),
    }

    // A later member sees nobody.
    let (alice, mut alice_events) = connect_client(port, "t-alice").await;
    let id = alice.join_project("p").await.unwrap();
    assert_eq!(ack(&mut alice_events, &id).await["users"], json!([]));
}

#[tokio::test]
async fn test_join_roster_and_announcement() {
    let port = start_test_server(MemoryStore::open(), ServerConfig::default()).await;
    let (_alice, mut alice_events) = joined(port, "t-alice").await;

    let (bob, mut bob_events) = connect_client(port, "t-bob").await;
    let id = bob.join_project("p").await.unwrap();

    let roster = match next(&mut bob_events).await {
        SyncEvent::Event {
            kind: EventKind::UsersCurrent,
            legacy: false,
            data,
        } => data,
        other => panic!("expected users:current, got {other:?}"),
    };
    let users = roster["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "alice");
    assert_eq!(ack(&mut bob_events, &id).await["users"], roster["users"]);

    let joined = collect(&mut alice_events, EventKind::UserJoined, Duration::from_millis(300)).await;
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["userId"], "bob");
    assert_eq!(joined[0]["projectId"], "p");
}

#[tokio::test]
async fn test_create_node_reaches_peer_once() {
    let port = start_test_server(MemoryStore::open(), ServerConfig::default()).await;
    let (alice, mut alice_events) = joined(port, "t-alice").await;
    let (_bob, mut bob_events) = joined(port, "t-bob").await;
    drain(&mut alice_events).await;

    let id = alice
        .create_node("p", NodeInput::new("What is weave?").with_position(10.0, 20.0))
        .await
        .unwrap();
    let data = ack(&mut alice_events, &id).await;
    let node_id = data["node"]["id"].as_str().unwrap().to_string();
    assert!(!node_id.is_empty());

    let created = collect(&mut bob_events, EventKind::NodeCreated, Duration::from_millis(300)).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["node"]["id"], node_id.as_str());
    assert_eq!(created[0]["node"]["position"]["x"], 10.0);

    // No echo.
    assert!(collect(&mut alice_events, EventKind::NodeCreated, Duration::from_millis(100))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_create_converges() {
    let store = MemoryStore::open();
    let port = start_test_server(store.clone(), ServerConfig::default()).await;
    let (alice, mut alice_events) = joined(port, "t-alice").await;
    let (bob, mut bob_events) = joined(port, "t-bob").await;
    drain(&mut alice_events).await;

    let (a, b) = tokio::join!(
        alice.create_node("p", NodeInput::new("from alice").with_id("shared")),
        bob.create_node("p", NodeInput::new("from bob").with_id("shared")),
    );
    let a = ack(&mut alice_events, &a.unwrap()).await;
    let b = ack(&mut bob_events, &b.unwrap()).await;

    let already: Vec<bool> = [&a, &b]
        .iter()
        .map(|d| d["alreadyExists"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(already.iter().filter(|x| **x).count(), 1);
    assert_eq!(a["node"]["prompt"], b["node"]["prompt"]);

    let graph = store.load_graph("p").await.unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert_eq!(graph.nodes["shared"].prompt, a["node"]["prompt"].as_str().unwrap());
}

#[tokio::test]
async fn test_cycle_rejected() {
    let store = MemoryStore::open();
    store
        .seed(
            "p",
            vec![Node::new("a", "a"), Node::new("b", "b").with_parents(["a"])],
            Vec::new(),
        )
        .await;
    let port = start_test_server(store.clone(), ServerConfig::default()).await;
    let (alice, mut events) = joined(port, "t-alice").await;

    let id = alice.create_edge("p", "b", "a").await.unwrap();
    match next(&mut events).await {
        SyncEvent::Error {
            code,
            message,
            request_id,
        } => {
            assert_eq!(code, "cycle");
            assert!(message.contains("b -> a"), "{message}");
            assert_eq!(request_id.as_deref(), Some(id.as_str()));
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
    // Only the seeded a -> b link is stored.
    let edges = store.load_graph("p").await.unwrap().edges;
    assert_eq!(edges.len(), 1);
    assert!(edges[0].connects("a", "b"));

    // Creating a node whose parent is itself is a validation error.
    let id = alice
        .create_node("p", NodeInput::new("loop").with_id("x").with_parents(["x"]))
        .await
        .unwrap();
    match next(&mut events).await {
        SyncEvent::Error { code, request_id, .. } => {
            assert_eq!(code, "validation");
            assert_eq!(request_id.as_deref(), Some(id.as_str()));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_cascades_staleness() {
    let store = MemoryStore::open();
    store
        .seed(
            "p",
            vec![
                Node::new("a", "a").with_response("first"),
                Node::new("b", "b").with_parents(["a"]).with_response("x"),
                Node::new("c", "c").with_parents(["b"]).with_response("y"),
                Node::new("d", "unrelated"),
            ],
            Vec::new(),
        )
        .await;
    let port = start_test_server(store.clone(), ServerConfig::default()).await;
    let (alice, mut alice_events) = joined(port, "t-alice").await;
    let (_bob, mut bob_events) = joined(port, "t-bob").await;
    drain(&mut alice_events).await;

    let patch = NodePatch {
        response: Some("second".into()),
        ..NodePatch::default()
    };
    let id = alice.update_node("p", "a", patch).await.unwrap();
    let data = ack(&mut alice_events, &id).await;
    assert_eq!(data["staled"], json!(["b", "c"]));

    let updates = collect(&mut bob_events, EventKind::NodeUpdated, Duration::from_millis(300)).await;
    let ids: Vec<&str> = updates.iter().map(|u| u["node"]["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(updates[1]["node"]["status"], "stale");

    for (id, status) in [("b", NodeStatus::Stale), ("c", NodeStatus::Stale), ("d", NodeStatus::Idle)] {
        assert_eq!(store.get_node("p", id).await.unwrap().unwrap().status, status);
    }
}

#[tokio::test]
async fn test_legacy_aliases_can_be_disabled() {
    let config = ServerConfig {
        emit_legacy_aliases: false,
        ..ServerConfig::default()
    };
    let port = start_test_server(MemoryStore::open(), config).await;
    let (alice, mut alice_events) = joined(port, "t-alice").await;
    let (_bob, mut bob_events) = joined(port, "t-bob").await;
    drain(&mut alice_events).await;

    alice.move_cursor("p", 1.0, 2.0, None).await.unwrap();
    let mut names = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), bob_events.recv()).await {
        if let SyncEvent::Event { kind, legacy, .. } = event {
            names.push((kind, legacy));
        }
    }
    assert_eq!(names, vec![(EventKind::CursorMoved, false)]);
}
