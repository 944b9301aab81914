//! Fan-out benchmarks for huddle-core.
//!
//! Measures chat broadcast and media relay to in-process sessions.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use huddle_core::{Hub, HubConfig, MemoryStore, Session};
use huddle_protocol::Envelope;
use huddle_transport::{MemoryConnection, MemoryPeer};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;

async fn populated_hub(members: usize) -> (Arc<Hub>, Vec<Arc<Session>>, Vec<MemoryPeer>) {
    let hub = Hub::start(HubConfig::default(), Arc::new(MemoryStore::new())).await;
    let mut sessions = Vec::new();
    let mut peers = Vec::new();
    for i in 0..members {
        let (conn, mut peer) = MemoryConnection::pair(format!("conn-{i}"));
        let (sink, _source) = conn.into_parts();
        let session = hub.register(peer.id().clone(), Box::new(sink), None);
        let _ = hub
            .dispatch(&session, Envelope::join(format!("user{i}"), "bench"))
            .await;
        peer.drain();
        sessions.push(session);
        peers.push(peer);
    }
    for peer in &mut peers {
        peer.drain();
    }
    (hub, sessions, peers)
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast");

    for members in [2, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &n| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let (hub, _sessions, mut peers) = populated_hub(n).await;
                    let envelope = Envelope::chat("bench", "hello").with_username("user0");

                    let start = Instant::now();
                    for _ in 0..iters {
                        hub.broadcaster()
                            .broadcast_to_channel("bench", &envelope, None)
                            .await;
                    }
                    let elapsed = start.elapsed();
                    for peer in &mut peers {
                        peer.drain();
                    }
                    elapsed
                })
            });
        });
    }

    group.finish();
}

fn bench_media_relay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("media_relay");
    let payload = "A".repeat(960);

    for members in [2, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &n| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let (hub, sessions, mut peers) = populated_hub(n).await;

                    let start = Instant::now();
                    for _ in 0..iters {
                        let frame = Envelope::media_frame("bench", payload.as_str(), Some(48_000));
                        let _ = hub.dispatch(&sessions[0], frame).await;
                    }
                    let elapsed = start.elapsed();
                    for peer in &mut peers {
                        peer.drain();
                    }
                    elapsed
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_media_relay);
criterion_main!(benches);
