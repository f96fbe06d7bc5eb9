use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{CommitPosition, Delivery, WorkConsumer, WorkPublisher};
use crate::error::QueueError;
use crate::model::ProbeMessage;

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredMessage>>>,
    committed: HashMap<(String, String, i32), i64>,
    commit_log: Vec<(String, CommitPosition)>,
    publish_failures: u32,
    commit_failures: u32,
}

struct BrokerInner {
    partitions: usize,
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-process broker with partitions, consumer groups and committed offsets.
///
/// Keys are hashed onto partitions, order is kept per partition, and a new
/// consumer in a group starts from that group's committed offsets, which is
/// enough to exercise redelivery after a restart.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        let mut hasher = DefaultHasher::new();
        key.unwrap_or_default().hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    /// Append a raw message. Returns its (partition, offset).
    pub fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<Vec<u8>>,
    ) -> Result<(i32, i64), QueueError> {
        let partition = self.partition_for(key);
        let offset = {
            let mut state = self.state();
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(QueueError::Publish("injected publish failure".into()));
            }
            let partitions = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.inner.partitions]);
            partitions[partition].push(StoredMessage { key: key.map(str::to_string), payload });
            partitions[partition].len() as i64 - 1
        };
        self.inner.notify.notify_waiters();
        Ok((partition as i32, offset))
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().publish_failures = count;
    }

    /// Make the next `count` commits fail
    pub fn fail_next_commits(&self, count: u32) {
        self.state().commit_failures = count;
    }

    pub fn publisher(&self, topic: &str) -> MemoryPublisher {
        MemoryPublisher { broker: self.clone(), topic: topic.to_string() }
    }

    /// Join `group` on `topic`, resuming from the group's committed offsets.
    pub fn consumer(&self, group: &str, topic: &str) -> MemoryConsumer {
        let cursors = {
            let state = self.state();
            (0..self.inner.partitions)
                .map(|partition| {
                    state
                        .committed
                        .get(&(group.to_string(), topic.to_string(), partition as i32))
                        .copied()
                        .unwrap_or(0)
                })
                .collect()
        };
        MemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            cursors: Mutex::new(Cursors { next: cursors, turn: 0, closed: false }),
        }
    }

    /// Committed position of a group on one partition
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state().committed.get(&(group.to_string(), topic.to_string(), partition)).copied()
    }

    /// Every successful commit, in order
    pub fn commit_log(&self, group: &str) -> Vec<CommitPosition> {
        self.state()
            .commit_log
            .iter()
            .filter(|(committed_by, _)| committed_by == group)
            .map(|(_, position)| position.clone())
            .collect()
    }

    /// All (key, payload) pairs on a topic, partition by partition
    pub fn messages(&self, topic: &str) -> Vec<(Option<String>, Option<Vec<u8>>)> {
        self.state()
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flatten()
                    .map(|message| (message.key.clone(), message.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn commit(&self, group: &str, position: &CommitPosition) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(QueueError::Commit("injected commit failure".into()));
        }
        state
            .committed
            .insert((group.to_string(), position.topic.clone(), position.partition), position.offset);
        state.commit_log.push((group.to_string(), position.clone()));
        Ok(())
    }
}

/// Publishes probe messages onto one topic of a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl WorkPublisher for MemoryPublisher {
    async fn publish(&self, messages: &[ProbeMessage]) -> Result<(), QueueError> {
        for message in messages {
            let payload = message.payload().map_err(|e| QueueError::Publish(e.to_string()))?;
            self.broker.send(&self.topic, Some(&message.endpoint), Some(payload))?;
        }
        Ok(())
    }
}

struct Cursors {
    next: Vec<i64>,
    turn: usize,
    closed: bool,
}

/// One group member reading every partition of a topic.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    topic: String,
    cursors: Mutex<Cursors>,
}

impl MemoryConsumer {
    fn cursors(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next message in round-robin partition order, if any is waiting
    fn try_next(&self) -> Result<Option<Delivery>, QueueError> {
        let mut cursors = self.cursors();
        if cursors.closed {
            return Err(QueueError::Closed);
        }
        let state = self.broker.state();
        let Some(partitions) = state.topics.get(&self.topic) else {
            return Ok(None);
        };

        let count = partitions.len();
        for step in 0..count {
            let partition = (cursors.turn + step) % count;
            let offset = cursors.next[partition];
            if let Some(message) = partitions[partition].get(offset as usize) {
                cursors.next[partition] += 1;
                cursors.turn = (partition + 1) % count;
                return Ok(Some(Delivery {
                    topic: self.topic.clone(),
                    partition: partition as i32,
                    offset,
                    key: message.key.clone(),
                    payload: message.payload.clone(),
                    received_at: Instant::now(),
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkConsumer for MemoryConsumer {
    async fn recv(&self) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    fn commit(&self, position: &CommitPosition) -> Result<(), QueueError> {
        self.broker.commit(&self.group, position)
    }

    async fn flush(&self, positions: &[CommitPosition]) -> Result<(), QueueError> {
        for position in positions {
            self.broker.commit(&self.group, position)?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.cursors().closed = true;
        self.broker.inner.notify.notify_waiters();
    }
}
