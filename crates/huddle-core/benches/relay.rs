//! Relay dispatch benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use huddle_core::{Relay, RelayConfig, Session};
use huddle_transport::{ChannelTransport, ConnectionId, Outbound};
use serde_json::json;
use std::sync::Arc;

fn room(size: usize) -> (Relay, Vec<Session>, Vec<Outbound>) {
    let transport = Arc::new(ChannelTransport::new());
    let relay = Relay::new(transport.clone(), RelayConfig::default());

    let mut sessions = Vec::with_capacity(size);
    let mut receivers = Vec::with_capacity(size);
    for i in 0..size {
        let conn = ConnectionId::new(format!("conn_{i}"));
        receivers.push(transport.register(conn.clone()));
        let mut session = Session::new(conn);
        relay
            .join_room(&mut session, "bench", &format!("client_{i}"))
            .unwrap();
        sessions.push(session);
    }

    (relay, sessions, receivers)
}

fn drain(receivers: &mut [Outbound]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Benchmark chat fan-out by room size.
fn bench_send_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_message");

    for size in [2, 10, 100] {
        let (relay, sessions, mut receivers) = room(size);
        drain(&mut receivers);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                relay
                    .send_message(&sessions[0], black_box("hello there"))
                    .unwrap();
                drain(&mut receivers);
            })
        });
    }

    group.finish();
}

/// Benchmark unicast signaling.
fn bench_signal(c: &mut Criterion) {
    let (relay, sessions, mut receivers) = room(10);
    drain(&mut receivers);
    let payload = json!({"type": "candidate", "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host"});

    c.bench_function("signal", |b| {
        b.iter(|| {
            relay
                .signal(&sessions[0], black_box("client_5"), payload.clone())
                .unwrap();
            drain(&mut receivers[5..6]);
        })
    });
}

/// Benchmark repeated joins of the same client.
fn bench_rejoin(c: &mut Criterion) {
    let (relay, _sessions, mut receivers) = room(10);
    let conn = ConnectionId::new("conn_3");

    c.bench_function("rejoin", |b| {
        b.iter(|| {
            let mut session = Session::new(conn.clone());
            relay
                .join_room(&mut session, "bench", black_box("client_3"))
                .unwrap();
            drain(&mut receivers);
        })
    });
}

criterion_group!(benches, bench_send_message, bench_signal, bench_rejoin);
criterion_main!(benches);
