//! Codec benchmarks for huddle-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, ClientEvent, ServerEvent};
use serde_json::json;

fn bench_encode_message(c: &mut Criterion) {
    let event = ClientEvent::send_message(Some(1), "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("json_64B", |b| b.iter(|| codec::encode_json(black_box(&event))));
    group.finish();
}

fn bench_decode_signal(c: &mut Criterion) {
    let event = ClientEvent::signal(
        None,
        "peer",
        json!({"type": "offer", "sdp": "v=0\r\n".repeat(40)}),
    );
    let encoded = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("signal_sdp", |b| {
        b.iter(|| codec::decode::<ClientEvent>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = ServerEvent::user_joined("client-1234", "conn_18a2f0c3");

    c.bench_function("roundtrip_user_joined", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<ServerEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_message,
    bench_decode_signal,
    bench_roundtrip
);
criterion_main!(benches);
