//! Probe worker pool.
//!
//! The poll loop only receives and records deliveries; each delivery gets its
//! own tracked handler task that waits for an admission slot, measures,
//! publishes the result and then reports the offset as done. Offsets are
//! committed through [`CommitTracker`], so a message whose result never made
//! it downstream is delivered again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ProbeConfig;
use crate::error::{GateError, QueueError, WorkerError};
use crate::gate::AdmissionGate;
use crate::model::{ErrorKind, MeasureResult, ProbeIdentity, ProbeMessage, ResultRecord};
use crate::probe::{MeasurementEngine, ProbeRequest};
use crate::queue::{CommitTracker, Delivery, WorkConsumer};
use crate::sink::{ResultSink, publish_with_retry};

/// Error code recorded when a queue message cannot be turned into a request
pub const INVALID_REQUEST_CODE: &str = "EINVALID_REQUEST";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Budget for messages that carry no timeout of their own
    pub default_timeout: Duration,
    pub publish_retries: u32,
    pub publish_retry_delay: Duration,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,
    /// Consecutive commit failures tolerated before the pool gives up
    pub commit_failure_limit: u32,
    /// Messages whose result was never published before the pool gives up.
    /// Each one pins its partition's committed position until a restart.
    pub stranded_limit: u32,
}

impl From<&ProbeConfig> for WorkerSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            default_timeout: config.request_timeout(),
            publish_retries: config.publish_retries,
            publish_retry_delay: Duration::from_millis(200),
            shutdown_grace: config.shutdown_grace(),
            commit_failure_limit: 5,
            stranded_limit: 1,
        }
    }
}

/// What a finished pool did, for the shutdown log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub received: u64,
    /// Handlers still running when the grace period ran out
    pub abandoned: usize,
    /// Messages left uncommitted for redelivery
    pub uncommitted: usize,
}

struct Shared {
    consumer: Arc<dyn WorkConsumer>,
    engine: Arc<MeasurementEngine>,
    sink: Arc<dyn ResultSink>,
    gate: AdmissionGate,
    commits: Mutex<CommitTracker>,
    identity: ProbeIdentity,
    settings: WorkerSettings,
    /// Cancels in-flight measurements on shutdown
    measurements: CancellationToken,
    /// Tripped when offsets can no longer be committed
    fatal: CancellationToken,
    commit_failures: AtomicU32,
    last_commit_error: Mutex<Option<String>>,
    stranded: AtomicU32,
    last_publish_error: Mutex<Option<String>>,
}

impl Shared {
    fn commits(&self) -> MutexGuard<'_, CommitTracker> {
        self.commits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a delivery done and commit if its partition moved forward.
    fn complete(&self, delivery: &Delivery) {
        let advanced = self.commits().complete(&delivery.topic, delivery.partition, delivery.offset);
        let Some(position) = advanced else {
            return;
        };

        match self.consumer.commit(&position) {
            Ok(()) => {
                self.commit_failures.store(0, Ordering::SeqCst);
                debug!(partition = position.partition, offset = position.offset, "Committed offset");
            }
            Err(e) => {
                let failures = self.commit_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(partition = position.partition, offset = position.offset, failures, "Offset commit failed: {e}");
                *self.last_commit_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                if failures >= self.settings.commit_failure_limit {
                    error!(failures, "Offset commits keep failing, stopping the worker pool");
                    self.fatal.cancel();
                }
            }
        }
    }

    /// Record a delivery whose result could not be published. It stays
    /// pending, so nothing after it on the partition can be committed.
    fn strand(&self, error: String) {
        *self.last_publish_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        let stranded = self.stranded.fetch_add(1, Ordering::SeqCst) + 1;
        if stranded >= self.settings.stranded_limit {
            error!(stranded, "Unpublished results are pinning committed offsets, stopping the worker pool");
            self.fatal.cancel();
        }
    }

    fn fatal_error(&self) -> WorkerError {
        let last = |slot: &Mutex<Option<String>>| {
            slot.lock().unwrap_or_else(PoisonError::into_inner).clone().unwrap_or_default()
        };
        let stranded = self.stranded.load(Ordering::SeqCst);
        if stranded > 0 && stranded >= self.settings.stranded_limit {
            return WorkerError::PublishUnavailable { stranded, last: last(&self.last_publish_error) };
        }
        WorkerError::CommitUnavailable {
            failures: self.commit_failures.load(Ordering::SeqCst),
            last: last(&self.last_commit_error),
        }
    }

    async fn measure(&self, message: &ProbeMessage) -> MeasureResult {
        let request = match ProbeRequest::from_message(message, self.settings.default_timeout) {
            Ok(request) => request,
            Err(e) => {
                warn!(endpoint = %message.endpoint, "Rejected probe message: {e}");
                return MeasureResult::failed(
                    message.endpoint.clone(),
                    Duration::ZERO,
                    ErrorKind::Unknown(INVALID_REQUEST_CODE.into()),
                    Some(e.to_string()),
                );
            }
        };

        match self.engine.measure(&request, &self.measurements).await {
            Ok(result) => result,
            Err(e) => {
                error!(endpoint = %message.endpoint, "Could not start measurement: {e}");
                MeasureResult::failed(message.endpoint.clone(), Duration::ZERO, ErrorKind::Transport, Some(e.to_string()))
            }
        }
    }

    async fn handle(self: Arc<Self>, delivery: Delivery) {
        let Some(message) = delivery.message() else {
            warn!(partition = delivery.partition, offset = delivery.offset, "Skipping probe message without a key");
            self.complete(&delivery);
            return;
        };

        // Held until the end so the slot covers measure, publish and commit
        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(GateError::Closed) => {
                debug!(endpoint = %message.endpoint, "Shutting down before admission, leaving message uncommitted");
                return;
            }
            Err(e) => {
                error!("Admission failed: {e}");
                return;
            }
        };

        let result = self.measure(&message).await;
        if result.error == Some(ErrorKind::Aborted) && self.measurements.is_cancelled() {
            debug!(endpoint = %message.endpoint, "Measurement aborted by shutdown, leaving message uncommitted");
            return;
        }

        let record = ResultRecord::from_measurement(&result, &message, &self.identity)
            .with_processing_latency(delivery.received_at.elapsed());

        match publish_with_retry(
            self.sink.as_ref(),
            &record,
            self.settings.publish_retries,
            self.settings.publish_retry_delay,
        )
        .await
        {
            Ok(()) => {
                debug!(
                    endpoint = %record.endpoint_id,
                    status = record.status_code,
                    ok = record.ok,
                    latency_ms = record.latency_ms,
                    "Published result"
                );
                self.complete(&delivery);
            }
            Err(e) => {
                error!(
                    endpoint = %record.endpoint_id,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Result not published, offset stays uncommitted: {e}"
                );
                self.strand(e.to_string());
            }
        }
    }
}

/// Consumes probe messages and runs them under a global concurrency ceiling.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tasks: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        consumer: Arc<dyn WorkConsumer>,
        engine: Arc<MeasurementEngine>,
        sink: Arc<dyn ResultSink>,
        identity: ProbeIdentity,
        settings: WorkerSettings,
    ) -> Result<Self, GateError> {
        let gate = AdmissionGate::new(settings.concurrency)?;
        Ok(Self {
            shared: Arc::new(Shared {
                consumer,
                engine,
                sink,
                gate,
                commits: Mutex::new(CommitTracker::new()),
                identity,
                settings,
                measurements: CancellationToken::new(),
                fatal: CancellationToken::new(),
                commit_failures: AtomicU32::new(0),
                last_commit_error: Mutex::new(None),
                stranded: AtomicU32::new(0),
                last_publish_error: Mutex::new(None),
            }),
            tasks: TaskTracker::new(),
        })
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.shared.gate
    }

    /// Fires when the pool stops because offsets can no longer advance
    pub fn fatal(&self) -> CancellationToken {
        self.shared.fatal.clone()
    }

    /// Messages received but not yet committed
    pub fn pending(&self) -> usize {
        self.shared.commits().pending()
    }

    /// Poll until `shutdown` (or a fatal commit or publish condition), then drain.
    ///
    /// Polling never waits for an admission slot; handlers queue on the gate
    /// while the consumer keeps its session alive.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PoolReport, WorkerError> {
        let shared = &self.shared;
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut received = 0u64;
        info!(concurrency = shared.gate.max(), probe_id = %shared.identity.probe_id, region = %shared.identity.region, "Worker pool started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = shared.fatal.cancelled() => break,
                next = shared.consumer.recv() => next,
            };

            match next {
                Ok(delivery) => {
                    backoff.reset();
                    received += 1;
                    shared.commits().begin(&delivery.topic, delivery.partition, delivery.offset);
                    self.tasks.spawn(shared.clone().handle(delivery));
                }
                Err(QueueError::Closed) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(delay_ms = delay.as_millis() as u64, "Failed to receive probe message: {e}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let report = self.drain(received).await;
        info!(received = report.received, abandoned = report.abandoned, uncommitted = report.uncommitted, "Worker pool stopped");

        if shared.fatal.is_cancelled() {
            return Err(shared.fatal_error());
        }
        Ok(report)
    }

    /// Stop admitting, abort measurements, wait for handlers, flush offsets,
    /// and only then release connection pools and the consumer.
    async fn drain(&self, received: u64) -> PoolReport {
        let shared = &self.shared;
        self.tasks.close();
        shared.gate.close();
        shared.measurements.cancel();

        let mut abandoned = 0;
        if tokio::time::timeout(shared.settings.shutdown_grace, self.tasks.wait()).await.is_err() {
            abandoned = self.tasks.len();
            warn!(abandoned, "Grace period elapsed with handlers still running");
        }

        let (positions, uncommitted) = {
            let commits = shared.commits();
            (commits.positions(), commits.pending())
        };
        if !positions.is_empty() {
            if let Err(e) = shared.consumer.flush(&positions).await {
                error!("Final offset flush failed: {e}");
            }
        }
        if let Err(e) = shared.sink.flush().await {
            warn!("Failed to flush result sink: {e}");
        }

        shared.engine.connections().shutdown();
        shared.consumer.close().await;

        PoolReport { received, abandoned, uncommitted }
    }
}
