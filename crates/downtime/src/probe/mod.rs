//! HTTP measurement: request validation, the per-attempt state machine,
//! body decoding under a size cap, error classification and the per-host
//! connection strategy.

pub mod attempt;
pub mod body;
pub mod classify;
mod connection;
mod engine;
mod validation;

pub use connection::{ConnectionManager, ConnectionSettings, HostActivity, Lease};
pub use engine::{EngineSettings, MeasurementEngine};
pub use validation::{MAX_HEADER_SIZE, MAX_HEADERS, MAX_TIMEOUT, MIN_TIMEOUT, ProbeRequest};
