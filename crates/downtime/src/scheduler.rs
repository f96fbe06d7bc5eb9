use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::index::DueIndex;
use crate::model::ProbeMessage;
use crate::queue::WorkPublisher;

/// Source of "now" in Unix seconds for due-time arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Clock moved by hand, for driving the loop deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Outcome of one scheduler iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was due
    Idle,
    Dispatched { published: usize, rescheduled: usize, removed: usize },
}

/// The single writer of the due-time index: drains due members into the
/// work queue and pushes them to their next due time.
pub struct SchedulerLoop {
    index: DueIndex,
    publisher: Arc<dyn WorkPublisher>,
    clock: Arc<dyn Clock>,
    settings: SchedulerConfig,
}

impl SchedulerLoop {
    pub fn new(
        index: DueIndex,
        publisher: Arc<dyn WorkPublisher>,
        clock: Arc<dyn Clock>,
        settings: SchedulerConfig,
    ) -> Self {
        Self { index, publisher, clock, settings }
    }

    pub fn index(&self) -> &DueIndex {
        &self.index
    }

    /// Poll, publish, then reschedule.
    ///
    /// Nothing is rescheduled when the publish fails, so the same members
    /// come back as due on the next iteration.
    pub async fn tick(&self) -> Result<Tick, SchedulerError> {
        let now = self.clock.now();
        let due = self.index.poll_due(now).await.map_err(SchedulerError::Index)?;
        if due.is_empty() {
            return Ok(Tick::Idle);
        }

        let configs = self.index.lookup(&due).await.map_err(SchedulerError::Index)?;
        let messages: Vec<ProbeMessage> = due
            .iter()
            .filter_map(|id| configs.get(id))
            .map(|config| {
                ProbeMessage::new(config.id.clone())
                    .scheduled_at(now)
                    .expected_status(config.expected_status)
            })
            .collect();

        if !messages.is_empty() {
            self.publisher.publish(&messages).await.map_err(SchedulerError::Publish)?;
        }

        let outcome = self.index.reschedule(&due, now).await.map_err(SchedulerError::Reschedule)?;
        debug!(
            due = due.len(),
            published = messages.len(),
            removed = outcome.removed,
            "Dispatched due endpoints"
        );

        Ok(Tick::Dispatched {
            published: messages.len(),
            rescheduled: outcome.rescheduled,
            removed: outcome.removed,
        })
    }

    /// Sleep unless shutdown comes first. Returns false on shutdown.
    async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Hydrate, then loop until `shutdown`. Infrastructure errors back off
    /// and retry; they never end the loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.settings.idle_sleep(), self.settings.max_backoff());

        loop {
            let now = self.clock.now();
            let hydrated = match self.index.hydrate(now).await {
                Ok(count) => self.index.reconcile(now).await.map(|_| count),
                Err(e) => Err(e),
            };
            match hydrated {
                Ok(count) => {
                    info!(endpoints = count, "Scheduler started");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(delay_ms = delay.as_millis() as u64, "Failed to hydrate due-time index: {e}");
                    if !Self::pause(&shutdown, delay).await {
                        return;
                    }
                }
            }
        }
        backoff.reset();

        let reconcile_every = self.settings.reconcile_interval();
        let mut last_reconcile = Instant::now();

        while !shutdown.is_cancelled() {
            if last_reconcile.elapsed() >= reconcile_every {
                last_reconcile = Instant::now();
                if let Err(e) = self.index.reconcile(self.clock.now()).await {
                    warn!("Reconciliation failed, will retry with the old watermark: {e}");
                }
            }

            let pause = match self.tick().await {
                Ok(Tick::Idle) => {
                    backoff.reset();
                    self.settings.idle_sleep()
                }
                Ok(Tick::Dispatched { .. }) => {
                    backoff.reset();
                    continue;
                }
                Err(e @ SchedulerError::Reschedule(_)) => {
                    warn!("{e}");
                    backoff.next_delay()
                }
                Err(e) => {
                    error!("{e}");
                    backoff.next_delay()
                }
            };

            if !Self::pause(&shutdown, pause).await {
                break;
            }
        }

        info!("Scheduler stopped");
    }
}
