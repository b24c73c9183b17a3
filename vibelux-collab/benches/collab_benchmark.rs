use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;
use vibelux_collab::ot::transform_against;
use vibelux_collab::protocol::PresencePayload;
use vibelux_collab::{
    apply, transform, BroadcastGroup, CollaborationEvent, CursorPosition, EventRouter, Operation,
    OutboundQueue, OverflowPolicy, Presence, PresenceRegistry, Priority, User,
};

fn sample_doc(chars: usize) -> String {
    "lorem ipsum dolor sit amet ".chars().cycle().take(chars).collect()
}

// ─── OT ──────────────────────────────────────────────────────────

fn bench_transform_insert_delete(c: &mut Criterion) {
    let a = Operation::insert(40, "fixture");
    let b = Operation::delete(10, 50);

    c.bench_function("transform_insert_vs_delete", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Priority::Left)))
    });
}

fn bench_transform_against_history(c: &mut Criterion) {
    let history: Vec<Operation> = (0..256)
        .map(|i| {
            if i % 3 == 0 {
                Operation::delete(i % 64, 2)
            } else {
                Operation::insert(i % 128, "ab")
            }
        })
        .collect();
    let op = Operation::insert(100, "late edit");

    c.bench_function("transform_against_256_ops", |b| {
        b.iter(|| black_box(transform_against(black_box(&op), history.iter(), Priority::Right)))
    });
}

fn bench_apply_insert_10k(c: &mut Criterion) {
    let doc = sample_doc(10_000);
    let op = Operation::insert(5_000, "grow light");

    c.bench_function("apply_insert_10k_chars", |b| {
        b.iter(|| black_box(apply(black_box(&doc), black_box(&op)).unwrap()))
    });
}

fn bench_apply_delete_10k(c: &mut Criterion) {
    let doc = sample_doc(10_000);
    let op = Operation::delete(2_500, 5_000);

    c.bench_function("apply_delete_10k_chars", |b| {
        b.iter(|| black_box(apply(black_box(&doc), black_box(&op)).unwrap()))
    });
}

// ─── Codec ───────────────────────────────────────────────────────

fn bench_cursor_encode(c: &mut Criterion) {
    let event = CollaborationEvent::cursor("alice", CursorPosition::new(120.5, 88.0));

    c.bench_function("cursor_encode", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_edit_decode(c: &mut Criterion) {
    let encoded = CollaborationEvent::edit("alice", Operation::insert(12, "hello"), Some(42))
        .encode()
        .unwrap();

    c.bench_function("edit_decode", |b| {
        b.iter(|| {
            let event = CollaborationEvent::decode(black_box(&encoded)).unwrap();
            black_box(event.edit_payload().unwrap())
        })
    });
}

// ─── Presence ────────────────────────────────────────────────────

fn bench_presence_update_100_peers(c: &mut Criterion) {
    let payloads: Vec<(String, PresencePayload)> = (0..100)
        .map(|i| {
            let id = format!("user-{i}");
            let user = User::new(&id, format!("User {i}"), format!("{id}@example.com"));
            let presence = Presence::new(user);
            (id, PresencePayload::from(&presence))
        })
        .collect();

    c.bench_function("presence_update_100_peers", |b| {
        b.iter(|| {
            let mut registry = PresenceRegistry::new("local", Duration::from_secs(300));
            let now = chrono::Utc::now();
            for (id, payload) in &payloads {
                black_box(registry.apply_presence_update(id, payload.clone(), now));
            }
            black_box(registry.active_users().len())
        })
    });
}

fn bench_router_cursor_stream(c: &mut Criterion) {
    let events: Vec<CollaborationEvent> = (0..1000)
        .map(|i| {
            CollaborationEvent::cursor(format!("user-{}", i % 10), CursorPosition::new(i as f64, 0.0))
        })
        .collect();

    c.bench_function("router_1000_cursor_events", |b| {
        b.iter(|| {
            let mut router = EventRouter::new("local", Duration::from_secs(300));
            for event in &events {
                black_box(router.route(event.clone()));
            }
        })
    });
}

// ─── Outbound queue & fan-out ────────────────────────────────────

fn bench_queue_overflow(c: &mut Criterion) {
    let event = CollaborationEvent::cursor("alice", CursorPosition::new(1.0, 2.0));

    c.bench_function("queue_5000_into_1000_drop_oldest", |b| {
        b.iter(|| {
            let mut queue = OutboundQueue::new(1000, OverflowPolicy::DropOldest);
            for _ in 0..5000 {
                black_box(queue.enqueue(event.clone()));
            }
            black_box(queue.drain().len())
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let event = CollaborationEvent::cursor("alice", CursorPosition::new(10.0, 20.0));

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            let mut group = BroadcastGroup::new(16);
            let receivers: Vec<_> = (0..100).map(|peer| group.add_peer(peer)).collect();
            let sent = group.broadcast(black_box(&event), Some(0)).unwrap();
            black_box((sent, receivers.len()))
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let frame = CollaborationEvent::cursor("alice", CursorPosition::new(10.0, 20.0))
        .encode()
        .unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            let mut group = BroadcastGroup::new(1024);
            let _receivers: Vec<_> = (0..100).map(|peer| group.add_peer(peer)).collect();
            for _ in 0..1000 {
                black_box(group.broadcast_raw(frame.clone().into(), None));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_transform_insert_delete,
    bench_transform_against_history,
    bench_apply_insert_10k,
    bench_apply_delete_10k,
    bench_cursor_encode,
    bench_edit_decode,
    bench_presence_update_100_peers,
    bench_router_cursor_stream,
    bench_queue_overflow,
    bench_broadcast_100_peers,
    bench_broadcast_1000_messages,
);
criterion_main!(benches);
