/// Worker pool and commit protocol tests
pub mod admission_tests;
pub mod commit_tests;
pub mod end_to_end_tests;

use std::sync::Arc;
use std::time::Duration;

use downtime::config::ProbeConfig;
use downtime::model::ProbeIdentity;
use downtime::probe::{ConnectionManager, ConnectionSettings, EngineSettings, MeasurementEngine};
use downtime::queue::MemoryBroker;
use downtime::sink::MemorySink;
use downtime::worker::{WorkerPool, WorkerSettings};

pub const TOPIC: &str = "monitoring.request";
pub const GROUP: &str = "probe-group-1";

pub fn settings(concurrency: usize) -> WorkerSettings {
    WorkerSettings {
        concurrency,
        default_timeout: Duration::from_secs(5),
        publish_retries: 0,
        publish_retry_delay: Duration::from_millis(1),
        shutdown_grace: Duration::from_secs(5),
        commit_failure_limit: 5,
        stranded_limit: 1,
    }
}

pub fn pool(broker: &MemoryBroker, sink: &MemorySink, settings: WorkerSettings) -> Arc<WorkerPool> {
    let mut config = ProbeConfig::default();
    config.connect_timeout_ms = 1_000;
    let connections = Arc::new(ConnectionManager::new(ConnectionSettings::from(&config)).unwrap());
    let engine = Arc::new(MeasurementEngine::new(connections, EngineSettings::from(&config)));

    Arc::new(
        WorkerPool::new(
            Arc::new(broker.consumer(GROUP, TOPIC)),
            engine,
            Arc::new(sink.clone()),
            ProbeIdentity { probe_id: "probe-fra-1".into(), region: "fra".into() },
            settings,
        )
        .unwrap(),
    )
}

/// Poll `condition` until it holds, failing the test after ten seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
