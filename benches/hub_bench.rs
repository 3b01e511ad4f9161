//! Benchmarks for the Switchboard hub
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use switchboard::websocket::{format_close_payload, CloseCode, ConnectionHandle, Hub, HubConfig, Packet};

fn bench_close_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("close_payload");

    group.bench_function("short_reason", |b| {
        b.iter(|| format_close_payload(black_box(CloseCode::GOING_AWAY), black_box("hub closed")))
    });

    // Forces truncation to the control-frame limit
    let long_reason = "é".repeat(200);
    group.bench_function("truncated_reason", |b| {
        b.iter(|| format_close_payload(black_box(CloseCode::INTERNAL_ERROR), black_box(&long_reason)))
    });

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("broadcast");

    for connections in [10, 100, 1000] {
        let hub = rt.block_on(async {
            let hub = Hub::new(HubConfig {
                outbound_buffer: 1024,
                ..Default::default()
            });

            for _ in 0..connections {
                let (handle, mut rx) = ConnectionHandle::new(1024);
                hub.register(handle).await.unwrap();
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
            }

            hub
        });

        let packet = Packet::text("x".repeat(256));
        group.throughput(Throughput::Elements(connections as u64));

        group.bench_function(format!("fanout_{}", connections), |b| {
            b.iter(|| {
                rt.block_on(async {
                    hub.broadcast(black_box(packet.clone())).await.unwrap();
                    // Stats is answered after pending deliveries
                    hub.stats().await.unwrap()
                })
            })
        });

        rt.block_on(hub.close());
    }

    group.finish();
}

criterion_group!(benches, bench_close_payload, bench_broadcast);
criterion_main!(benches);
