//! # wirebus Benchmarks
//!
//! | Path | What is measured |
//! |------|------------------|
//! | codec | JSON encode and decode of a call |
//! | validation | Keyword argument check against a signature |
//! | transport | Publish, group read and ack on the in-memory broker |
//! | rpc | Full call round trip between two in-process clients |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wirebus_client::{rpc_fn, BusClient, BusConfig, InMemoryBroker, InMemorySchemaStore, Kwargs};
use wirebus_schema::validate_kwargs;
use wirebus_transport::{ReadCursor, StartPosition, Transport};
use wirebus_types::{decode, encode, CallMessage};

fn resize_kwargs() -> Kwargs {
    json!({"url": "https://example.com/pet/1.jpg", "width": 200, "height": 200})
        .as_object()
        .cloned()
        .unwrap_or_default()
}

// ============================================================================
// CODEC
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let call = CallMessage::new(
        "image",
        "resize",
        resize_kwargs(),
        "store.p1:results",
        Duration::from_secs(5),
    );
    let bytes = encode(&call).unwrap();

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_call", |b| b.iter(|| black_box(encode(&call).unwrap())));
    group.bench_function("decode_call", |b| {
        b.iter(|| black_box(decode::<CallMessage>(&bytes).unwrap()))
    });
    group.finish();
}

// ============================================================================
// VALIDATION
// ============================================================================

fn bench_validation(c: &mut Criterion) {
    let api = wirebus_node::demo::image_api().unwrap();
    let parameters = api.rpc("resize").unwrap().parameters.clone();
    let kwargs = resize_kwargs();

    c.bench_function("validation/resize_kwargs", |b| {
        b.iter(|| black_box(validate_kwargs("image", "resize", &parameters, &kwargs).is_ok()))
    });
}

// ============================================================================
// TRANSPORT
// ============================================================================

fn bench_transport(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("transport");

    for batch in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("publish_read_ack", batch), &batch, |b, &batch| {
            let transport = Arc::new(InMemoryBroker::new()).connect();
            let channels = vec!["bench.*:stream".to_string()];
            runtime
                .block_on(transport.ensure_group(&channels[0], "bench", StartPosition::Latest))
                .unwrap();

            b.to_async(&runtime).iter(|| async {
                for _ in 0..batch {
                    transport.publish(&channels[0], b"{}").await.unwrap();
                }
                let entries = transport
                    .read_group(&channels, "bench", "c1", ReadCursor::New, batch, Duration::ZERO)
                    .await
                    .unwrap();
                for entry in &entries {
                    transport.ack(&entry.channel, "bench", entry.id).await.unwrap();
                }
                black_box(entries.len())
            });
        });
    }
    group.finish();
}

// ============================================================================
// RPC
// ============================================================================

fn bench_rpc_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let schemas = Arc::new(InMemorySchemaStore::new());

    let connect = |service: &str| {
        let mut config = BusConfig::named(service, "bench");
        config.consumer.block_ms = 50;
        BusClient::builder(config)
            .transport(Arc::new(broker.connect()))
            .schema_store(schemas.clone())
            .connect()
    };

    let (server, caller) = runtime.block_on(async {
        let server = connect("image").await.unwrap();
        server
            .register_api(wirebus_node::demo::image_api().unwrap())
            .await
            .unwrap();
        server
            .bind_rpc(
                "image",
                "resize",
                rpc_fn(&["url", "width", "height"], |_args: Kwargs| async {
                    Ok::<_, anyhow::Error>(json!("https://placehold.it/200x200"))
                }),
            )
            .await
            .unwrap();
        let runner = server.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                eprintln!("bench server stopped: {e}");
            }
        });
        server.wait_ready().await;
        let caller = connect("store").await.unwrap();
        (server, caller)
    });

    c.bench_function("rpc/call_round_trip", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(caller.call("image", "resize", resize_kwargs()).await.unwrap())
        })
    });

    runtime.block_on(async {
        caller.stop(Duration::from_secs(1)).await.unwrap();
        server.stop(Duration::from_secs(1)).await.unwrap();
    });
}

criterion_group!(
    benches,
    bench_codec,
    bench_validation,
    bench_transport,
    bench_rpc_round_trip
);
criterion_main!(benches);
