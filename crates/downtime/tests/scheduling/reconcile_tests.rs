use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use downtime::index::{DueIndex, MemoryScheduleStore, ScheduleStore};
use downtime::model::{EndpointConfig, ScheduleEntry};
use downtime::store::MemoryConfigStore;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn row(id: &str, interval: u64, updated: i64) -> EndpointConfig {
    EndpointConfig::new(id, Duration::from_secs(interval)).updated_at(at(updated))
}

fn setup(rows: Vec<EndpointConfig>) -> (Arc<MemoryConfigStore>, Arc<MemoryScheduleStore>, DueIndex) {
    let configs = Arc::new(MemoryConfigStore::with_rows(rows));
    let store = Arc::new(MemoryScheduleStore::new());
    let index = DueIndex::new(configs.clone(), store.clone(), 2);
    (configs, store, index)
}

#[tokio::test]
async fn test_first_run_is_full_sync() {
    let (_, store, index) = setup(vec![
        row("https://a.example", 30, 1),
        row("https://b.example", 60, 2),
        row("https://c.example", 60, 3).inactive(),
    ]);

    let outcome = index.reconcile(1_000).await.unwrap();

    assert!(outcome.full);
    assert_eq!(outcome.upserted, 2);
    assert_eq!(outcome.watermark, Some(at(3)));
    assert_eq!(store.members().await.unwrap(), ["https://a.example", "https://b.example"]);
    assert_eq!(store.score("https://a.example").await.unwrap(), Some(1_030));
    assert_eq!(index.watermark().await.unwrap(), Some(at(3)));
}

#[tokio::test]
async fn test_incremental_pass_applies_only_changes() {
    let (configs, store, index) = setup(vec![row("https://a.example", 30, 1), row("https://b.example", 60, 2)]);
    index.reconcile(1_000).await.unwrap();

    configs.upsert(row("https://new.example", 15, 10)).await;
    configs.set_active("https://b.example", false, at(11)).await;

    let outcome = index.reconcile(2_000).await.unwrap();

    assert!(!outcome.full);
    assert_eq!(outcome.upserted, 1);
    assert_eq!(outcome.removed, 1);
    assert_eq!(outcome.watermark, Some(at(11)));
    assert_eq!(store.members().await.unwrap(), ["https://a.example", "https://new.example"]);
    // Untouched rows keep their schedule
    assert_eq!(store.score("https://a.example").await.unwrap(), Some(1_030));
    assert_eq!(store.score("https://new.example").await.unwrap(), Some(2_015));
}

#[tokio::test]
async fn test_nothing_changed_keeps_watermark() {
    let (_, store, index) = setup(vec![row("https://a.example", 30, 1)]);
    index.reconcile(1_000).await.unwrap();

    let outcome = index.reconcile(1_500).await.unwrap();

    assert_eq!(outcome.upserted, 0);
    assert_eq!(outcome.removed, 0);
    assert_eq!(outcome.watermark, Some(at(1)));
    assert_eq!(store.score("https://a.example").await.unwrap(), Some(1_030));
}

#[tokio::test]
async fn test_corrupt_or_empty_watermark_falls_back_to_full_sync() {
    for raw in ["", "   ", "yesterday-ish"] {
        let (_, store, index) = setup(vec![row("https://a.example", 30, 1)]);
        store.upsert(&[ScheduleEntry::new("https://deleted.example", 5)]).await.unwrap();
        store.set_watermark(raw).await.unwrap();

        let outcome = index.reconcile(1_000).await.unwrap();

        assert!(outcome.full, "watermark {raw:?}");
        assert_eq!(store.members().await.unwrap(), ["https://a.example"]);
        assert_eq!(index.watermark().await.unwrap(), Some(at(1)));
    }
}

#[tokio::test]
async fn test_failed_pass_leaves_watermark_and_is_repeatable() {
    let (configs, store, index) = setup(vec![row("https://a.example", 30, 1)]);
    index.reconcile(1_000).await.unwrap();

    configs.upsert(row("https://b.example", 60, 20)).await;
    configs.set_active("https://a.example", false, at(21)).await;

    store.fail_next_writes(1).await;
    assert!(index.reconcile(2_000).await.is_err());
    assert_eq!(index.watermark().await.unwrap(), Some(at(1)));

    let outcome = index.reconcile(2_100).await.unwrap();
    assert_eq!(outcome.upserted, 1);
    assert_eq!(outcome.removed, 1);
    assert_eq!(index.watermark().await.unwrap(), Some(at(21)));
    assert_eq!(store.members().await.unwrap(), ["https://b.example"]);
    assert_eq!(store.score("https://b.example").await.unwrap(), Some(2_160));
}
