//! Shared tracing bootstrap for the downtime binaries.
//!
//! `RUST_LOG` controls filtering and `RUST_LOG_FORMAT=json` switches to
//! structured JSON lines.

mod subscriber;

pub use subscriber::{LogFormat, init_tracing, init_tracing_with};
