use std::time::Duration;

use downtime::error::WorkerError;
use downtime::model::{ErrorKind, ProbeMessage};
use downtime::queue::{MemoryBroker, WorkPublisher};
use downtime::sink::MemorySink;
use tokio_util::sync::CancellationToken;

use super::{GROUP, TOPIC, eventually, pool, settings};
use crate::fixtures::{Reply, TestServer, closed_port_url};

#[tokio::test]
async fn test_refused_target_is_published_and_committed() {
    let broker = MemoryBroker::new(1);
    let target = closed_port_url().await;
    broker.publisher(TOPIC).publish(&[ProbeMessage::new(target.clone())]).await.unwrap();

    let sink = MemorySink::new();
    let pool = pool(&broker, &sink, settings(4));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually(|| broker.committed(GROUP, TOPIC, 0) == Some(1)).await;
    shutdown.cancel();
    running.await.unwrap().unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].ok);
    assert_eq!(records[0].status_code, 599);
    assert_eq!(records[0].error_kind, Some(ErrorKind::ConnectionRefused));
    assert_eq!(records[0].endpoint_id, target);
}

#[tokio::test]
async fn test_failed_publish_stops_pool_and_is_redelivered() {
    let server = TestServer::start(Reply::ok("up")).await;
    let broker = MemoryBroker::new(1);
    let messages: Vec<ProbeMessage> = (0..50).map(|i| ProbeMessage::new(server.url(&format!("/{i}")))).collect();
    broker.publisher(TOPIC).publish(&messages).await.unwrap();

    // The first result is lost, which pins the partition at offset 0
    let sink = MemorySink::new();
    sink.fail_next(1);
    let first = pool(&broker, &sink, settings(1));
    let result = tokio::time::timeout(Duration::from_secs(10), first.run(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(WorkerError::PublishUnavailable { stranded: 1, .. })));
    assert!(first.fatal().is_cancelled());
    assert_eq!(broker.committed(GROUP, TOPIC, 0).unwrap_or(0), 0);
    assert!(sink.len() < 50);

    // A restarted consumer in the same group sees every message again
    let published_before = sink.len();
    let second = pool(&broker, &sink, settings(4));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = second.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually(|| broker.committed(GROUP, TOPIC, 0) == Some(50)).await;
    shutdown.cancel();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.received, 50);
    assert_eq!(report.uncommitted, 0);

    let redelivered = &sink.records()[published_before..];
    assert_eq!(redelivered.len(), 50);
    assert!(redelivered.iter().any(|record| record.endpoint_id == server.url("/0")));
}

#[tokio::test]
async fn test_commits_follow_lowest_unfinished_offset() {
    let slow = TestServer::start(Reply::ok("slow").delayed(Duration::from_millis(500))).await;
    let fast = TestServer::start(Reply::ok("fast")).await;
    let broker = MemoryBroker::new(1);
    broker
        .publisher(TOPIC)
        .publish(&[ProbeMessage::new(slow.url("/")), ProbeMessage::new(fast.url("/"))])
        .await
        .unwrap();

    let sink = MemorySink::new();
    let pool = pool(&broker, &sink, settings(4));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    // The fast one finishes first but cannot move the position past the slow one
    eventually(|| sink.len() == 1).await;
    assert_eq!(sink.records()[0].endpoint_id, fast.url("/"));
    assert_eq!(broker.committed(GROUP, TOPIC, 0).unwrap_or(0), 0);

    eventually(|| broker.committed(GROUP, TOPIC, 0) == Some(2)).await;
    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert!(broker.commit_log(GROUP).windows(2).all(|pair| pair[0].offset <= pair[1].offset));
}
