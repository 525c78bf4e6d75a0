use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uuid::Uuid;

use vellum_collab::{
    BroadcastGroup, CollabDocument, RoomId, SnapshotPayload, SyncMessage,
};

fn bench_message_encode(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let room = RoomId::for_document("bench-doc");
    let update = vec![0u8; 64]; // typical small yrs update

    c.bench_function("message_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(client),
                black_box(room.clone()),
                black_box(update.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let room = RoomId::for_document("bench-doc");
    let encoded = SyncMessage::update(client, room, vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("message_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_snapshot_envelope_round_trip(c: &mut Criterion) {
    let doc = CollabDocument::create("bench-doc", "bench-user").unwrap();
    doc.append(&"The quick brown fox jumps over the lazy dog. ".repeat(32));
    let state = doc.encode_state();

    c.bench_function("snapshot_envelope_round_trip", |b| {
        b.iter(|| {
            let payload = SnapshotPayload::from_state(black_box(&state));
            black_box(payload.decode().unwrap());
        })
    });
}

fn bench_snapshot_apply(c: &mut Criterion) {
    let doc = CollabDocument::create("bench-doc", "bench-user").unwrap();
    doc.append(&"Collaborative paragraph content. ".repeat(64));
    let state = doc.encode_state();

    c.bench_function("snapshot_apply_fresh_doc", |b| {
        b.iter(|| {
            let fresh = CollabDocument::create("bench-doc", "bench-user").unwrap();
            fresh.apply_loaded_snapshot(black_box(&state)).unwrap();
            black_box(fresh.content().len());
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(4096);
    // 100 passive receivers; lagging is fine for throughput measurement.
    let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();

    c.bench_function("broadcast_fanout_100_peers", |b| {
        b.iter(|| {
            group.broadcast_raw(black_box(Arc::new(vec![0u8; 64])));
        })
    });

    drop(receivers);
}

fn bench_room_derivation(c: &mut Criterion) {
    c.bench_function("room_id_for_document", |b| {
        b.iter(|| {
            black_box(RoomId::for_document(black_box(
                "press release: Q3 earnings (final v2)",
            )));
        })
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_snapshot_envelope_round_trip,
    bench_snapshot_apply,
    bench_broadcast_fan_out,
    bench_room_derivation,
);
criterion_main!(benches);
