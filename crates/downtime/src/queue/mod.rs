//! Work queue plumbing: the publisher used by the scheduler, the consumer used
//! by the probe workers, and the offset bookkeeping that decides what may be
//! committed.

use std::time::Instant;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::model::ProbeMessage;

mod commit;
#[cfg(feature = "kafka")]
pub mod kafka;
mod memory;

pub use commit::{CommitPosition, CommitTracker};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryPublisher};

/// One message handed to the probe side, owned so it can outlive the poll.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub received_at: Instant,
}

impl Delivery {
    /// The probe request carried by this delivery. `None` when the key is
    /// missing, since the key names the target.
    pub fn message(&self) -> Option<ProbeMessage> {
        let key = self.key.as_deref().map(str::trim).filter(|key| !key.is_empty())?;
        Some(ProbeMessage::from_parts(key, self.payload.as_deref()))
    }
}

/// Scheduler side of the queue.
#[async_trait]
pub trait WorkPublisher: Send + Sync {
    /// Publish one message per entry, keyed by endpoint. Fails if any of them
    /// was not acknowledged by the broker.
    async fn publish(&self, messages: &[ProbeMessage]) -> Result<(), QueueError>;
}

/// Probe side of the queue. Auto-commit is off; offsets move only through
/// `commit` and `flush`.
#[async_trait]
pub trait WorkConsumer: Send + Sync {
    async fn recv(&self) -> Result<Delivery, QueueError>;

    /// Request a commit without waiting for the broker's answer
    fn commit(&self, position: &CommitPosition) -> Result<(), QueueError>;

    /// Commit and wait, used once on shutdown
    async fn flush(&self, positions: &[CommitPosition]) -> Result<(), QueueError>;

    async fn close(&self);
}
