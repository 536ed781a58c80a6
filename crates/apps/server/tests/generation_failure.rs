mod common;

use common::{TestGenerator, TestServer};
use reactocraft_protocol::{ChunkCoordinate, Packet};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn failing_chunk_is_retried_once_then_reported_unavailable() {
    let broken = ChunkCoordinate::new(5, 5);
    let server = TestServer::start(TestGenerator::new().failing_at(broken)).await;
    let mut client = server.connect().await;
    client.login("alice", 8).await;

    match client.request_chunk(5, 5).await {
        Packet::ChunkUnavailable { coord, reason } => {
            assert_eq!(coord, broken);
            assert!(reason.contains("(5, 5)"), "{reason}");
        }
        other => panic!("expected ChunkUnavailable, got {other:?}"),
    }
    assert_eq!(server.generator.calls_for(broken), 2);
    assert!(!server.pipeline.cache().contains(broken));
    assert!(!server.storage.contains(broken));
    assert_eq!(server.metrics.generation_failures.load(Ordering::Relaxed), 1);

    // the connection and the pipeline carry on
    assert!(matches!(
        client.request_chunk(0, 0).await,
        Packet::ChunkData { .. }
    ));

    // failures are not remembered: asking again tries again
    assert!(matches!(
        client.request_chunk(5, 5).await,
        Packet::ChunkUnavailable { .. }
    ));
    assert_eq!(server.generator.calls_for(broken), 4);

    server.stop().await;
}

#[tokio::test]
async fn responses_keep_request_order_across_failures() {
    let broken = ChunkCoordinate::new(1, 1);
    let server = TestServer::start(TestGenerator::new().failing_at(broken)).await;
    let mut client = server.connect().await;
    client.login("alice", 8).await;

    let order = [
        ChunkCoordinate::new(2, 0),
        broken,
        ChunkCoordinate::new(0, 2),
        ChunkCoordinate::new(2, 0),
    ];
    for coord in order {
        client.send(Packet::ChunkRequest { coord }).await;
    }
    client.send(Packet::KeepAlive { id: 77 }).await;

    for expected in order {
        match client.recv().await {
            Packet::ChunkData { coord, .. } | Packet::ChunkUnavailable { coord, .. } => {
                assert_eq!(coord, expected)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(client.recv().await, Packet::KeepAlive { id: 77 });

    server.stop().await;
}
