use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::backoff::Backoff;
use crate::error::SinkError;
use crate::model::ResultRecord;

/// Downstream destination for result records. A successful `publish` is
/// what allows the originating queue offset to be committed.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, record: &ResultRecord) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Publish, retrying with backoff. Gives up after `retries` extra attempts
/// and returns the last error.
pub async fn publish_with_retry(
    sink: &dyn ResultSink,
    record: &ResultRecord,
    retries: u32,
    base_delay: Duration,
) -> Result<(), SinkError> {
    let mut backoff = Backoff::new(base_delay, base_delay.saturating_mul(32));
    let mut attempt = 0;
    loop {
        match sink.publish(record).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < retries => {
                attempt += 1;
                let delay = backoff.next_delay();
                warn!(
                    endpoint = %record.endpoint_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Result publish failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One JSON object per line, appended to a file or written to stdout.
pub struct JsonLinesSink {
    writer: tokio::sync::Mutex<Writer>,
}

impl JsonLinesSink {
    pub async fn append_to(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn stdout() -> Self {
        Self::from_writer(Box::new(tokio::io::stdout()))
    }

    pub fn from_writer(writer: Writer) -> Self {
        Self { writer: tokio::sync::Mutex::new(writer) }
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn publish(&self, record: &ResultRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

/// Publishes to every inner sink; succeeds only if all of them did.
pub struct TeeSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ResultSink for TeeSink {
    async fn publish(&self, record: &ResultRecord) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.publish(record).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaResultSink;

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use async_trait::async_trait;
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

    use super::ResultSink;
    use crate::config::KafkaConfig;
    use crate::error::SinkError;
    use crate::model::ResultRecord;

    /// Result records on the result topic, keyed by endpoint.
    pub struct KafkaResultSink {
        producer: FutureProducer,
        topic: String,
        send_timeout: Duration,
    }

    impl KafkaResultSink {
        pub fn new(kafka: &KafkaConfig) -> Result<Self, SinkError> {
            let producer =
                crate::queue::kafka::producer(kafka).map_err(|e| SinkError::Publish(e.to_string()))?;
            Ok(Self {
                producer,
                topic: kafka.result_topic.clone(),
                send_timeout: Duration::from_millis(kafka.message_timeout_ms),
            })
        }
    }

    #[async_trait]
    impl ResultSink for KafkaResultSink {
        async fn publish(&self, record: &ResultRecord) -> Result<(), SinkError> {
            let payload = serde_json::to_vec(record)?;
            let message = FutureRecord::to(&self.topic).key(record.endpoint_id.as_str()).payload(&payload);
            self.producer
                .send(message, self.send_timeout)
                .await
                .map(|_| ())
                .map_err(|(e, _)| SinkError::Publish(e.to_string()))
        }

        async fn flush(&self) -> Result<(), SinkError> {
            let producer = self.producer.clone();
            let timeout = self.send_timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| SinkError::Publish(e.to_string()))?
                .map_err(|e| SinkError::Publish(e.to_string()))
        }
    }
}

#[derive(Default)]
struct MemorySinkState {
    records: Vec<ResultRecord>,
    failures: u32,
}

/// Collects records in memory; failures can be injected.
#[derive(Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` publishes fail
    pub fn fail_next(&self, count: u32) {
        self.state().failures = count;
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.state().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, record: &ResultRecord) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SinkError::Publish("injected publish failure".into()));
        }
        state.records.push(record.clone());
        Ok(())
    }
}
