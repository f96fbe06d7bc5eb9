use std::sync::Arc;
use std::time::Duration;

use downtime::config::SchedulerConfig;
use downtime::index::{DueIndex, MemoryScheduleStore, ScheduleStore};
use downtime::model::{EndpointConfig, ProbeMessage};
use downtime::queue::MemoryBroker;
use downtime::scheduler::{ManualClock, SchedulerLoop, Tick};
use downtime::store::MemoryConfigStore;

const TOPIC: &str = "monitoring.request";

struct Harness {
    configs: Arc<MemoryConfigStore>,
    store: Arc<MemoryScheduleStore>,
    clock: Arc<ManualClock>,
    broker: MemoryBroker,
    scheduler: SchedulerLoop,
}

fn harness(rows: Vec<EndpointConfig>) -> Harness {
    let configs = Arc::new(MemoryConfigStore::with_rows(rows));
    let store = Arc::new(MemoryScheduleStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let broker = MemoryBroker::new(3);
    let scheduler = SchedulerLoop::new(
        DueIndex::new(configs.clone(), store.clone(), 10),
        Arc::new(broker.publisher(TOPIC)),
        clock.clone(),
        SchedulerConfig::default(),
    );
    Harness { configs, store, clock, broker, scheduler }
}

#[tokio::test]
async fn test_edge_health_is_dispatched_and_rescheduled() {
    let h = harness(vec![EndpointConfig::new("https://edge-health.example", Duration::from_secs(30))]);

    h.scheduler.index().hydrate(0).await.unwrap();
    assert_eq!(h.store.score("https://edge-health.example").await.unwrap(), Some(30));

    h.clock.set(29);
    assert!(h.scheduler.index().poll_due(29).await.unwrap().is_empty());
    assert_eq!(h.scheduler.tick().await.unwrap(), Tick::Idle);

    h.clock.set(30);
    assert_eq!(h.scheduler.index().poll_due(30).await.unwrap(), ["https://edge-health.example"]);
    assert_eq!(
        h.scheduler.tick().await.unwrap(),
        Tick::Dispatched { published: 1, rescheduled: 1, removed: 0 }
    );

    let messages = h.broker.messages(TOPIC);
    assert_eq!(messages.len(), 1);
    let (key, payload) = &messages[0];
    assert_eq!(key.as_deref(), Some("https://edge-health.example"));
    let message = ProbeMessage::from_parts(key.as_deref().unwrap(), payload.as_deref());
    assert_eq!(message.scheduled_at, Some(30));
    assert_eq!(message.expected_status, Some(200));

    assert_eq!(h.store.score("https://edge-health.example").await.unwrap(), Some(60));
    assert_eq!(h.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_poll_due_never_mutates() {
    let h = harness(vec![
        EndpointConfig::new("https://a.example", Duration::from_secs(10)),
        EndpointConfig::new("https://b.example", Duration::from_secs(20)),
    ]);
    h.scheduler.index().hydrate(100).await.unwrap();

    for _ in 0..3 {
        assert_eq!(h.scheduler.index().poll_due(115).await.unwrap(), ["https://a.example"]);
    }
    assert_eq!(h.store.score("https://a.example").await.unwrap(), Some(110));
    assert_eq!(h.store.score("https://b.example").await.unwrap(), Some(120));
}

#[tokio::test]
async fn test_reschedule_uses_current_interval() {
    let h = harness(vec![EndpointConfig::new("https://a.example", Duration::from_secs(30))]);
    h.scheduler.index().hydrate(0).await.unwrap();

    h.configs.upsert(EndpointConfig::new("https://a.example", Duration::from_secs(120))).await;
    h.clock.set(30);
    h.scheduler.tick().await.unwrap();

    assert_eq!(h.store.score("https://a.example").await.unwrap(), Some(150));
}

#[tokio::test]
async fn test_deactivated_endpoint_is_dropped_not_dispatched() {
    let h = harness(vec![
        EndpointConfig::new("https://a.example", Duration::from_secs(30)),
        EndpointConfig::new("https://b.example", Duration::from_secs(30)),
    ]);
    h.scheduler.index().hydrate(0).await.unwrap();
    h.configs.set_active("https://b.example", false, chrono::Utc::now()).await;

    h.clock.set(30);
    assert_eq!(
        h.scheduler.tick().await.unwrap(),
        Tick::Dispatched { published: 1, rescheduled: 1, removed: 1 }
    );
    assert_eq!(h.store.members().await.unwrap(), ["https://a.example"]);
    assert_eq!(h.broker.messages(TOPIC).len(), 1);
}

#[tokio::test]
async fn test_failed_reschedule_still_published() {
    let h = harness(vec![EndpointConfig::new("https://a.example", Duration::from_secs(30))]);
    h.scheduler.index().hydrate(0).await.unwrap();

    h.clock.set(30);
    h.store.fail_next_writes(1).await;
    assert!(h.scheduler.tick().await.is_err());
    assert_eq!(h.broker.messages(TOPIC).len(), 1);

    // Still due, so it goes out again early: a duplicate, never a loss
    assert!(matches!(h.scheduler.tick().await, Ok(Tick::Dispatched { published: 1, .. })));
    assert_eq!(h.broker.messages(TOPIC).len(), 2);
    assert_eq!(h.store.score("https://a.example").await.unwrap(), Some(60));
}
