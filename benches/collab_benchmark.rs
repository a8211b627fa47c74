use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chorus::protocol::Message;
use chorus::room::{ClientHandle, Room};
use chorus::transform::{Schema, Step};
use tokio::sync::mpsc;

fn bench_message_encode(c: &mut Criterion) {
    let msg = Message::Steps {
        room_id: "room-1".into(),
        client_id: "alice".into(),
        version: Some(42),
        steps: vec![Step::insert(128, "typical edit").to_json()],
        client_selection: None,
    };

    c.bench_function("message_encode_steps", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let msg = Message::Steps {
        room_id: "room-1".into(),
        client_id: "alice".into(),
        version: Some(42),
        steps: vec![Step::insert(128, "typical edit").to_json()],
        client_selection: None,
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("message_decode_steps", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_step_apply(c: &mut Criterion) {
    // Apply a mid-document edit against a 4KB document.
    let doc = Step::insert(0, "lorem ipsum ".repeat(340))
        .apply(&Schema.empty_doc())
        .unwrap();
    let step = Step::replace(2000, 2010, "refactored");

    c.bench_function("step_apply_4k_doc", |b| {
        b.iter(|| black_box(black_box(&step).apply(black_box(&doc)).unwrap()))
    });
}

fn bench_room_fan_out(c: &mut Criterion) {
    // One accepted batch fanned out to 99 other clients.
    let mut room = Room::new("bench");
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel();
        room.handle_join(ClientHandle::new(i, tx), &format!("client-{i}"), None, 0);
        receivers.push(rx);
    }

    c.bench_function("room_steps_fan_out_100_clients", |b| {
        let mut version = room.version();
        b.iter(|| {
            room.handle_steps("client-0", Some(version), &[Step::insert(0, "x").to_json()]);
            version += 1;
            // Drain so the queues don't grow across iterations.
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_step_apply,
    bench_room_fan_out
);
criterion_main!(benches);
