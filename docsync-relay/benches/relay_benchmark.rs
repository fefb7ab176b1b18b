use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use docsync_core::awareness::encode_update;
use docsync_core::{
    AwarenessEntry, AwarenessTracker, ConnectionId, Message, ReplicaStore, SyncMessage,
    YrsReplica,
};
use docsync_relay::{BroadcastGroup, DocumentRegistry};
use serde_json::json;
use yrs::{Text, WriteTxn};

fn small_delta() -> Vec<u8> {
    YrsReplica::new().edit(|txn| {
        let text = txn.get_or_insert_text("content");
        text.insert(txn, 0, "The quick brown fox jumps over the lazy dog");
    })
}

fn presence_entries(count: u64) -> Vec<AwarenessEntry> {
    (0..count)
        .map(|id| AwarenessEntry {
            client_id: id,
            clock: 1,
            state: Some(json!({
                "user": { "name": format!("User-{id}"), "color": "#4ECDC4" },
                "cursor": { "x": id, "y": id * 2 },
            })),
        })
        .collect()
}

fn bench_update_encode(c: &mut Criterion) {
    let delta = small_delta();

    c.bench_function("update_encode", |b| {
        b.iter(|| black_box(Message::update(black_box(delta.clone())).encode()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Message::update(small_delta()).encode();

    c.bench_function("update_decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_encode_100(c: &mut Criterion) {
    let entries = presence_entries(100);

    c.bench_function("awareness_encode_100_clients", |b| {
        b.iter(|| black_box(encode_update(black_box(&entries))))
    });
}

fn bench_awareness_apply_100(c: &mut Criterion) {
    let update = encode_update(&presence_entries(100));

    c.bench_function("awareness_apply_100_clients", |b| {
        b.iter(|| {
            let mut tracker = AwarenessTracker::new();
            black_box(tracker.apply_update(black_box(&update), ConnectionId(1)).unwrap());
        })
    });
}

fn bench_replica_apply(c: &mut Criterion) {
    let delta = small_delta();

    c.bench_function("replica_apply_delta", |b| {
        b.iter(|| {
            let mut replica = YrsReplica::new();
            black_box(replica.apply_delta(black_box(&delta)).unwrap());
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut subscriptions: Vec<_> = (0..100).map(|i| group.subscribe(ConnectionId(i))).collect();
    let payload = Message::update(small_delta()).encode();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast(ConnectionId(0), black_box(payload.clone())));
            for subscription in &mut subscriptions {
                black_box(subscription.try_recv());
            }
        })
    });
}

fn bench_session_relay_delta(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = DocumentRegistry::new(1024);
    let (session, _attachment) = rt.block_on(registry.attach("bench", ConnectionId(1)));
    let mut writer = YrsReplica::new();

    c.bench_function("session_relay_delta", |b| {
        b.iter(|| {
            let delta = writer.edit(|txn| {
                let text = txn.get_or_insert_text("content");
                text.insert(txn, 0, "x");
            });
            rt.block_on(async {
                let msg = SyncMessage::Update(delta);
                black_box(session.handle_sync(ConnectionId(2), msg).await.unwrap());
            });
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode_100,
    bench_awareness_apply_100,
    bench_replica_apply,
    bench_broadcast_100_peers,
    bench_session_relay_delta,
);
criterion_main!(benches);
