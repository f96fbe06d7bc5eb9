use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info};

use super::{CommitPosition, Delivery, WorkConsumer, WorkPublisher};
use crate::config::KafkaConfig;
use crate::error::QueueError;
use crate::model::ProbeMessage;

/// Connection and security settings shared by producers and consumers.
///
/// SASL credentials without an explicit `security.protocol` imply SASL over
/// TLS, which is what hosted brokers expect.
pub fn client_config(kafka: &KafkaConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", kafka.bootstrap_servers.as_str());

    if let Some(protocol) = &kafka.security_protocol {
        config.set("security.protocol", protocol.as_str());
    }
    if let (Some(mechanism), Some(user), Some(pass)) =
        (&kafka.sasl_mechanism, &kafka.sasl_username, &kafka.sasl_password)
    {
        if kafka.security_protocol.is_none() {
            config.set("security.protocol", "SASL_SSL");
        }
        config
            .set("sasl.mechanism", mechanism.as_str())
            .set("sasl.username", user.as_str())
            .set("sasl.password", pass.as_str());
    }
    config
}

pub fn producer(kafka: &KafkaConfig) -> Result<FutureProducer, QueueError> {
    client_config(kafka)
        .set("message.timeout.ms", kafka.message_timeout_ms.to_string())
        .create()
        .map_err(|e| QueueError::Connection(e.to_string()))
}

/// Scheduler-side producer for the request topic.
#[derive(Clone)]
pub struct KafkaWorkPublisher {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaWorkPublisher {
    pub fn new(kafka: &KafkaConfig) -> Result<Self, QueueError> {
        Ok(Self {
            producer: producer(kafka)?,
            topic: kafka.request_topic.clone(),
            send_timeout: Duration::from_millis(kafka.message_timeout_ms),
        })
    }
}

#[async_trait]
impl WorkPublisher for KafkaWorkPublisher {
    async fn publish(&self, messages: &[ProbeMessage]) -> Result<(), QueueError> {
        let payloads = messages
            .iter()
            .map(|message| message.payload().map_err(|e| QueueError::Publish(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let sends = messages.iter().zip(&payloads).map(|(message, payload)| {
            let record = FutureRecord::to(&self.topic).key(message.endpoint.as_str()).payload(payload);
            self.producer.send(record, self.send_timeout)
        });

        let mut failures = 0;
        let mut last_error = None;
        for result in futures::future::join_all(sends).await {
            if let Err((e, _)) = result {
                failures += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) => {
                error!(topic = %self.topic, failures, total = messages.len(), "Kafka batch publish failed: {e}");
                Err(QueueError::Publish(format!("{failures} of {} messages not acknowledged: {e}", messages.len())))
            }
        }
    }
}

/// Probe-side consumer in a consumer group with manual commits.
#[derive(Clone)]
pub struct KafkaWorkConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaWorkConsumer {
    pub fn subscribe(kafka: &KafkaConfig) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = client_config(kafka)
            .set("group.id", kafka.group_id.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", kafka.auto_offset_reset.as_str())
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .create()
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        consumer
            .subscribe(&[kafka.request_topic.as_str()])
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        info!(topic = %kafka.request_topic, group = %kafka.group_id, "Subscribed to request topic");

        Ok(Self { consumer: Arc::new(consumer) })
    }

    fn partition_list(positions: &[CommitPosition]) -> Result<TopicPartitionList, QueueError> {
        let mut list = TopicPartitionList::new();
        for position in positions {
            list.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset))
                .map_err(|e| QueueError::Commit(e.to_string()))?;
        }
        Ok(list)
    }
}

#[async_trait]
impl WorkConsumer for KafkaWorkConsumer {
    async fn recv(&self) -> Result<Delivery, QueueError> {
        let message = self.consumer.recv().await.map_err(|e| QueueError::Receive(e.to_string()))?;

        Ok(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec),
            received_at: Instant::now(),
        })
    }

    fn commit(&self, position: &CommitPosition) -> Result<(), QueueError> {
        let list = Self::partition_list(std::slice::from_ref(position))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| QueueError::Commit(e.to_string()))
    }

    async fn flush(&self, positions: &[CommitPosition]) -> Result<(), QueueError> {
        if positions.is_empty() {
            return Ok(());
        }
        let list = Self::partition_list(positions)?;
        let consumer = self.consumer.clone();

        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| QueueError::Commit(e.to_string()))?
            .map_err(|e| QueueError::Commit(e.to_string()))?;

        debug!(partitions = positions.len(), "Flushed final offsets");
        Ok(())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!("Unsubscribed from request topic");
    }
}
