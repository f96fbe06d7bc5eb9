//! FIFO counting semaphore bounding in-flight measurements.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::GateError;

struct GateState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

struct GateInner {
    max: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the slot to the longest waiter still listening, or return it to
    /// the pool. Waiters whose acquire was dropped are skipped.
    fn release(&self) -> Result<(), GateError> {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                debug!(waiting = state.waiters.len(), "Admission slot handed to waiter");
                return Ok(());
            }
        }
        if state.available >= self.max {
            return Err(GateError::OverRelease { max: self.max });
        }
        state.available += 1;
        Ok(())
    }
}

/// Shared admission gate. Cloning shares the same slots.
///
/// `acquire` takes a free slot immediately or queues; `release` wakes the
/// head of the queue directly instead of bumping the counter, so the
/// counter plus held permits always equals `max`.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("AdmissionGate")
            .field("max", &self.inner.max)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// A held slot, returned to the gate on drop.
#[must_use = "dropping a permit releases the slot immediately"]
pub struct Permit {
    gate: Option<Arc<GateInner>>,
}

impl Permit {
    /// Detach the slot from this guard; the caller must `release` it.
    pub fn forget(mut self) {
        self.gate = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            // A permit always accounts for one taken slot, so this cannot
            // overflow unless the raw `release` API was misused alongside it.
            let _ = gate.release();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").field("held", &self.gate.is_some()).finish()
    }
}

/// Queued acquire. If it is dropped after the slot was handed over but
/// before it was observed, the slot is passed on.
struct Waiter {
    gate: Arc<GateInner>,
    receiver: Option<oneshot::Receiver<()>>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                let _ = self.gate.release();
            }
        }
    }
}

impl AdmissionGate {
    pub fn new(max: usize) -> Result<Self, GateError> {
        if max == 0 {
            return Err(GateError::InvalidMax);
        }
        Ok(Self {
            inner: Arc::new(GateInner {
                max,
                state: Mutex::new(GateState {
                    available: max,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// Take a slot, waiting in FIFO order when none is free
    pub async fn acquire(&self) -> Result<Permit, GateError> {
        let receiver = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(GateError::Closed);
            }
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return Ok(self.permit());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            debug!(waiting = state.waiters.len(), "Waiting for admission slot");
            receiver
        };

        let mut waiter = Waiter { gate: self.inner.clone(), receiver: Some(receiver) };
        let granted = match waiter.receiver.as_mut() {
            Some(receiver) => receiver.await.is_ok(),
            None => false,
        };
        waiter.receiver = None;

        if granted { Ok(self.permit()) } else { Err(GateError::Closed) }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state();
        if state.closed || state.available == 0 || !state.waiters.is_empty() {
            return None;
        }
        state.available -= 1;
        Some(self.permit())
    }

    /// Return a slot obtained through [`Permit::forget`]. Releasing more
    /// slots than were taken is reported as an error.
    pub fn release(&self) -> Result<(), GateError> {
        self.inner.release()
    }

    /// Refuse new acquires and wake every queued acquirer with an error.
    /// Held permits stay valid and release normally.
    pub fn close(&self) {
        let mut state = self.inner.state();
        state.closed = true;
        let dropped = state.waiters.len();
        state.waiters.clear();
        if dropped > 0 {
            debug!(dropped, "Admission gate closed with waiters");
        }
    }

    pub fn available(&self) -> usize {
        self.inner.state().available
    }

    pub fn waiting(&self) -> usize {
        self.inner.state().waiters.len()
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    fn permit(&self) -> Permit {
        Permit { gate: Some(self.inner.clone()) }
    }
}
