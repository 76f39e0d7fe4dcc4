use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use serde_json::json;
use sockeye_server::delivery::DeliveryEngine;
use sockeye_server::protocol::{Frame, Reply};
use sockeye_server::registry::{ConnectionHandle, ConnectionRegistry};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = r#"{"action":"deliver","secret_token":"S","payload":{"msg":"hi","n":42},"identifiers":["user-1","user-2","user-3"]}"#;

    c.bench_function("frame_decode_deliver", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(frame)).unwrap());
        })
    });
}

fn bench_push_encode(c: &mut Criterion) {
    let payload = json!({"title": "New message", "body": "x".repeat(256)});

    c.bench_function("push_encode_256B", |b| {
        b.iter(|| {
            black_box(Reply::push(black_box(payload.clone())).encode().unwrap());
        })
    });
}

fn bench_registry_register_unregister(c: &mut Criterion) {
    let rt = runtime();
    let registry = ConnectionRegistry::new();

    c.bench_function("registry_register_unregister", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (conn, _rx) = ConnectionHandle::channel();
                let id = conn.id();
                registry.register("user-42", conn).await;
                black_box(registry.unregister(id).await);
            })
        })
    });
}

fn bench_registry_lookup(c: &mut Criterion) {
    let rt = runtime();
    let registry = ConnectionRegistry::new();
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..10_000 {
            let (conn, rx) = ConnectionHandle::channel();
            registry.register(&format!("user-{}", i % 1_000), conn).await;
            receivers.push(rx);
        }
    });

    c.bench_function("registry_lookup_10_devices", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(registry.lookup(black_box("user-500")).await);
            })
        })
    });
}

fn bench_fan_out_100(c: &mut Criterion) {
    let rt = runtime();
    let registry = ConnectionRegistry::new();
    let engine = DeliveryEngine::new(registry.clone());
    let mut receivers = Vec::new();
    let identifiers: Vec<String> = (0..100).map(|i| format!("user-{i}")).collect();
    rt.block_on(async {
        for identifier in &identifiers {
            let (conn, rx) = ConnectionHandle::channel();
            registry.register(identifier, conn).await;
            receivers.push(rx);
        }
    });
    let payload = json!({"msg": "hello"});

    c.bench_function("deliver_fan_out_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(engine.deliver(&payload, &identifiers).await);
            });
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_frame_decode,
    bench_push_encode,
    bench_registry_register_unregister,
    bench_registry_lookup,
    bench_fan_out_100,
);
criterion_main!(benches);
