use std::sync::Arc;
use std::time::Duration;

use downtime::config::SchedulerConfig;
use downtime::index::{DueIndex, MemoryScheduleStore, ScheduleStore};
use downtime::model::EndpointConfig;
use downtime::queue::MemoryBroker;
use downtime::scheduler::{ManualClock, SchedulerLoop, Tick};
use downtime::sink::MemorySink;
use downtime::store::MemoryConfigStore;
use tokio_util::sync::CancellationToken;

use super::{GROUP, TOPIC, eventually, pool, settings};
use crate::fixtures::{Reply, TestServer};

#[tokio::test]
async fn test_scheduled_endpoint_is_measured_published_and_committed() {
    let server = TestServer::start(Reply::json(200, r#"{"ok":true}"#).delayed(Duration::from_millis(50))).await;
    let endpoint = server.url("/edge-health");

    let configs = Arc::new(MemoryConfigStore::with_rows([
        EndpointConfig::new(endpoint.clone(), Duration::from_secs(30)).expected_status(200),
    ]));
    let store = Arc::new(MemoryScheduleStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let broker = MemoryBroker::new(2);
    let scheduler = SchedulerLoop::new(
        DueIndex::new(configs, store.clone(), 10),
        Arc::new(broker.publisher(TOPIC)),
        clock.clone(),
        SchedulerConfig::default(),
    );

    scheduler.index().hydrate(0).await.unwrap();
    clock.set(30);
    assert!(matches!(scheduler.tick().await.unwrap(), Tick::Dispatched { published: 1, .. }));
    assert_eq!(store.score(&endpoint).await.unwrap(), Some(60));

    let sink = MemorySink::new();
    let pool = pool(&broker, &sink, settings(8));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually(|| sink.len() == 1).await;
    eventually(|| pool.pending() == 0).await;
    shutdown.cancel();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.received, 1);

    let record = &sink.records()[0];
    assert!(record.ok);
    assert_eq!(record.status_code, 200);
    assert_eq!(record.error_kind, None);
    assert_eq!(record.endpoint_id, endpoint);
    assert_eq!(record.expected_status, Some(200));
    assert_eq!(record.probe_id, "probe-fra-1");
    assert_eq!(record.region, "fra");
    assert!(record.latency_ms >= 50, "{}", record.latency_ms);
    assert!(record.latency_ms < 2_000, "{}", record.latency_ms);
    assert!(record.processing_latency_ms.unwrap() >= record.latency_ms);

    let committed: i64 =
        (0..2).map(|partition| broker.committed(GROUP, TOPIC, partition).unwrap_or(0)).sum();
    assert_eq!(committed, 1);
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_and_leaves_offset() {
    let server = TestServer::start(Reply::ok("late").delayed(Duration::from_secs(30))).await;
    let broker = MemoryBroker::new(1);
    broker.send(TOPIC, Some(&server.url("/hang")), None).unwrap();

    let sink = MemorySink::new();
    let pool = pool(&broker, &sink, settings(2));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    eventually(|| pool.gate().available() == 1).await;
    eventually(|| server.hits() == 1).await;

    let started = std::time::Instant::now();
    shutdown.cancel();
    let report = running.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.uncommitted, 1);
    assert!(sink.is_empty());
    assert_eq!(broker.committed(GROUP, TOPIC, 0), None);
    assert_eq!(pool.gate().available(), 2);
}
