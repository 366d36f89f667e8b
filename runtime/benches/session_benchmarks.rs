//! Session Benchmarks
//!
//! - Codec: envelope encode/decode cost
//! - Round trip: one request/response over an in-memory pair
//! - Fan-out: concurrent requests sharing one session
//! - Event log: append and replay
//!
//! Run with: `cargo bench -p duplex-rpc-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use duplex_rpc_core::codec;
use duplex_rpc_core::envelope::Envelope;
use duplex_rpc_core::event_log::EventLog;
use duplex_rpc_core::stream::StreamId;
use duplex_rpc_runtime::config::SessionConfig;
use duplex_rpc_runtime::event_log::InMemoryEventLog;
use duplex_rpc_runtime::session::{HandlerRegistry, RequestOptions, Session};
use duplex_rpc_testing::memory;
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn echo_pair(runtime: &Runtime) -> Session {
    runtime.block_on(async {
        let mut registry = HandlerRegistry::new();
        registry.on_request("echo", |cx| async move {
            Ok(cx.raw_params().cloned().unwrap_or_default())
        });
        let (left, right) = memory::pair(256);
        let _server = Session::start(right, registry, SessionConfig::default());
        Session::start(left, HandlerRegistry::new(), SessionConfig::default())
    })
}

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let request = Envelope::request(
        7,
        "tools/call",
        Some(json!({"name": "search", "arguments": {"query": "rust", "limit": 10}})),
    );
    let bytes = codec::encode(&request).expect("encode");

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_request", |b| {
        b.iter(|| codec::encode(black_box(&request)));
    });
    group.bench_function("decode_request", |b| {
        b.iter(|| codec::decode(black_box(&bytes)));
    });
    group.finish();
}

fn benchmark_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    let runtime = runtime();
    let session = echo_pair(&runtime);

    group.bench_function("echo", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = session
                .send_request("echo", Some(black_box(json!({"n": 1}))), RequestOptions::default())
                .await;
        });
    });

    for concurrency in [8usize, 64] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(BenchmarkId::new("concurrent", concurrency), &concurrency, |b, &n| {
            b.to_async(&runtime).iter(|| async {
                let calls = (0..n).map(|i| {
                    session.send_request("echo", Some(json!({"n": i})), RequestOptions::default())
                });
                let _ = futures::future::join_all(calls).await;
            });
        });
    }
    group.finish();
}

fn benchmark_event_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log");
    let runtime = runtime();
    let message = Envelope::notification("notifications/progress", Some(json!({"progress": 1})));

    group.bench_function("store_event", |b| {
        let log = InMemoryEventLog::new().with_max_events_per_stream(1024);
        let stream = StreamId::new("bench");
        b.to_async(&runtime).iter(|| async {
            let _ = log.store_event(stream.clone(), black_box(message.clone())).await;
        });
    });

    group.bench_function("replay_100", |b| {
        let log = InMemoryEventLog::new();
        let stream = StreamId::new("bench");
        let first = runtime.block_on(async {
            let first = log
                .store_event(stream.clone(), message.clone())
                .await
                .expect("store");
            for _ in 0..100 {
                log.store_event(stream.clone(), message.clone())
                    .await
                    .expect("store");
            }
            first
        });
        b.to_async(&runtime).iter(|| async {
            let (tx, mut rx) = tokio::sync::mpsc::channel(128);
            let _ = log.replay_events_after(first.clone(), tx).await;
            while rx.recv().await.is_some() {}
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_codec,
    benchmark_round_trip,
    benchmark_event_log,
);
criterion_main!(benches);
