//! Integration tests for cross-instance fan-out.
//!
//! Two servers share one in-process broker and one store, standing in for
//! two processes behind a load balancer.

use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use weave_collab::{
    Broker, EventKind, GraphStore, Identity, MemoryBroker, MemoryStore, NodeInput, ServerConfig,
    StaticTokenAuthenticator, SyncClient, SyncEvent, SyncServer,
};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_instance(store: MemoryStore, broker: Arc<dyn Broker>) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let auth = StaticTokenAuthenticator::new()
        .with_token("t-alice", Identity::new("alice", "Alice"))
        .with_token("t-bob", Identity::new("bob", "Bob"))
        .with_token("t-carol", Identity::new("carol", "Carol"));
    let server = SyncServer::with_broker(config, Arc::new(store), Arc::new(auth), broker);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn joined(port: u16, token: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), Some(token.to_string()));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let id = client.join_project("p").await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(SyncEvent::Ack { request_id, .. }) if request_id == id => break,
            Some(_) => {}
            None => panic!("channel closed"),
        }
    }
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), events.recv()).await {}
    (client, events)
}

/// Namespaced events of `kind` received within `window`.
async fn collect(events: &mut Receiver<SyncEvent>, kind: EventKind, window: Duration) -> Vec<serde_json::Value> {
    let mut found = Vec::new();
    while let Ok(Some(event)) = timeout(window, events.recv()).await {
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

#[tokio::test]
async fn test_events_cross_instances() {
    let store = MemoryStore::open();
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let port_a = start_instance(store.clone(), broker.clone()).await;
    let port_b = start_instance(store.clone(), broker).await;

    let (alice, mut alice_events) = joined(port_a, "t-alice").await;
    let (_bob, mut bob_events) = joined(port_b, "t-bob").await;
    let (_carol, mut carol_events) = joined(port_a, "t-carol").await;

    // Bob's join on B is announced to Alice on A.
    let announced = collect(&mut alice_events, EventKind::UserJoined, Duration::from_millis(300)).await;
    let users: Vec<&str> = announced.iter().map(|d| d["userId"].as_str().unwrap()).collect();
    assert_eq!(users, vec!["bob", "carol"]);

    alice
        .create_node("p", NodeInput::new("shared").with_id("n1"))
        .await
        .unwrap();

    let on_b = collect(&mut bob_events, EventKind::NodeCreated, Duration::from_millis(300)).await;
    assert_eq!(on_b.len(), 1);
    assert_eq!(on_b[0]["node"]["id"], "n1");
    let on_a = collect(&mut carol_events, EventKind::NodeCreated, Duration::from_millis(300)).await;
    assert_eq!(on_a.len(), 1);

    // The origin still gets no echo through the broker.
    assert!(collect(&mut alice_events, EventKind::NodeCreated, Duration::from_millis(100))
        .await
        .is_empty());
    assert!(store.get_node("p", "n1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cursor_crosses_instances_once() {
    let store = MemoryStore::open();
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let port_a = start_instance(store.clone(), broker.clone()).await;
    let port_b = start_instance(store, broker).await;

    let (alice, _alice_events) = joined(port_a, "t-alice").await;
    let (_bob, mut bob_events) = joined(port_b, "t-bob").await;

    alice.move_cursor("p", 5.0, 6.0, None).await.unwrap();
    let moved = collect(&mut bob_events, EventKind::CursorMoved, Duration::from_millis(300)).await;
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0]["userId"], "alice");
}

#[tokio::test]
async fn test_unavailable_broker_degrades_to_local() {
    let store = MemoryStore::open();
    let memory = Arc::new(MemoryBroker::new());
    memory.set_available(false);
    let broker: Arc<dyn Broker> = memory;
    let port_a = start_instance(store.clone(), broker.clone()).await;
    let port_b = start_instance(store, broker).await;

    let (alice, _alice_events) = joined(port_a, "t-alice").await;
    let (_carol, mut carol_events) = joined(port_a, "t-carol").await;
    let (_bob, mut bob_events) = joined(port_b, "t-bob").await;

    alice
        .create_node("p", NodeInput::new("local").with_id("n2"))
        .await
        .unwrap();

    // Same-instance peers are still served; the other instance is not.
    assert_eq!(
        collect(&mut carol_events, EventKind::NodeCreated, Duration::from_millis(300))
            .await
            .len(),
        1
    );
    assert!(collect(&mut bob_events, EventKind::NodeCreated, Duration::from_millis(200))
        .await
        .is_empty());
}
