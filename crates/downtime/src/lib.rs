//! downtime - scheduling, probing and result delivery for fleet-scale HTTP
//! latency monitoring.
//!
//! A single scheduler keeps a due-time index of every active endpoint and
//! publishes probe messages when they come due. Probe processes consume those
//! messages under a global concurrency ceiling, measure each target, publish
//! a result record and only then commit the message's offset.

pub mod aggregate;
pub mod backoff;
pub mod config;
pub mod error;
pub mod gate;
pub mod index;
pub mod model;
pub mod probe;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod sink;
pub mod store;
pub mod worker;

// Re-export main types
pub use config::Config;
pub use gate::{AdmissionGate, Permit};
pub use index::DueIndex;
pub use model::{ErrorKind, MeasureResult, ProbeMessage, ResultRecord};
pub use probe::{ConnectionManager, MeasurementEngine};
pub use scheduler::SchedulerLoop;
pub use worker::WorkerPool;
