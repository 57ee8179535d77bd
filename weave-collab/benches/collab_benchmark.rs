use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use serde_json::json;
use std::sync::Arc;
use weave_collab::{
    BroadcastEnvelope, BroadcastGroup, ClientFrame, ClientMessage, Delivery, EventKind, Identity,
    NodeInput, OfflineQueue, PresenceEntry, PresenceRegistry, ServerFrame,
};

fn bench_client_frame_parse(c: &mut Criterion) {
    let text = ClientFrame::new(ClientMessage::NodeCreate {
        project_id: "p".into(),
        node: NodeInput::new("Summarize the findings").with_parents(["a", "b"]),
    })
    .with_request_id("r1")
    .to_text()
    .unwrap();

    c.bench_function("client_frame_parse_node_create", |b| {
        b.iter(|| black_box(ClientFrame::parse(black_box(&text)).unwrap()))
    });
}

fn bench_cursor_frames(c: &mut Criterion) {
    let data = json!({ "projectId": "p", "userId": "alice", "x": 120.5, "y": 80.0 });

    c.bench_function("cursor_frames_with_legacy", |b| {
        b.iter(|| {
            for frame in ServerFrame::for_event(EventKind::CursorMoved, black_box(&data), true) {
                black_box(frame.to_text().unwrap());
            }
        })
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let data = json!({ "projectId": "p", "node": { "id": "n1", "prompt": "x".repeat(256) } });

    c.bench_function("envelope_encode_decode_render", |b| {
        b.iter(|| {
            let envelope =
                BroadcastEnvelope::new("p", EventKind::NodeCreated, black_box(&data), Some("s1".into()))
                    .unwrap();
            let bytes = envelope.encode().unwrap();
            let decoded = BroadcastEnvelope::decode(&bytes).unwrap();
            black_box(decoded.render(true).unwrap());
        })
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    receivers.push(group.add_member(&format!("s{i}")).await);
                }

                let delivery = Arc::new(Delivery::new(vec!["{}".to_string()], Some("s0".into())));
                black_box(group.broadcast(black_box(delivery)));
            });
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    receivers.push(group.add_member(&format!("s{i}")).await);
                }

                for i in 0..1000u64 {
                    let delivery = Arc::new(Delivery::new(vec![i.to_string()], None));
                    group.broadcast(black_box(delivery));
                }
            });
        })
    });
}

fn bench_roster_500_sockets(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = PresenceRegistry::new();
    rt.block_on(async {
        // 100 users with five tabs each.
        for i in 0..500u64 {
            let identity = Identity::new(format!("u{}", i % 100), format!("User {}", i % 100));
            registry
                .join("p", PresenceEntry::new(format!("s{i}"), &identity, i))
                .await;
        }
    });

    c.bench_function("roster_500_sockets", |b| {
        b.iter(|| rt.block_on(async { black_box(registry.roster("p", Some("s0")).await) }))
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(1000);
            for i in 0..1000 {
                queue.enqueue(format!("{{\"event\":\"ping\",\"requestId\":\"r{i}\"}}"));
            }
            black_box(queue.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_client_frame_parse,
    bench_cursor_frames,
    bench_envelope_roundtrip,
    bench_broadcast_100_members,
    bench_broadcast_1000_messages,
    bench_roster_500_sockets,
    bench_offline_queue,
);
criterion_main!(benches);
