use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration problems. These are fatal at start-up and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialise config: {0}")]
    Serialise(#[from] toml::ser::Error),

    #[error("No config path available: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures talking to the config store or the schedule store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Malformed row: {0}")]
    Decode(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(error.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(error.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for StoreError {
    fn from(error: deadpool_redis::PoolError) -> Self {
        StoreError::Connection(error.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::redis::RedisError> for StoreError {
    fn from(error: deadpool_redis::redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
            StoreError::Connection(error.to_string())
        } else {
            StoreError::Query(error.to_string())
        }
    }
}

/// Work-queue broker failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Consumer closed")]
    Closed,
}

/// Result publishing failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0:#}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Admission gate misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Admission gate needs at least one slot")]
    InvalidMax,

    #[error("Admission gate released more times than acquired (max {max})")]
    OverRelease { max: usize },

    #[error("Admission gate is closed")]
    Closed,
}

/// Synchronous rejection of a malformed probe request.
///
/// Network and timeout failures never show up here; they are classified
/// into the measurement result instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe target is empty")]
    EmptyTarget,

    #[error("Invalid target URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("Timeout {actual:?} outside of [{min:?}, {max:?}]")]
    TimeoutOutOfBounds { actual: Duration, min: Duration, max: Duration },

    #[error("Too many headers: {count} (max: {max})")]
    TooManyHeaders { count: usize, max: usize },

    #[error("Header {name} too large: {size} bytes (max: {max} bytes)")]
    HeaderTooLarge { name: String, size: usize, max: usize },

    #[error("Invalid header {0}")]
    InvalidHeader(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Scheduler loop failures, tagged by the step that failed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Due-time index unavailable: {0}")]
    Index(#[source] StoreError),

    #[error("Failed to publish probe messages: {0}")]
    Publish(#[source] QueueError),

    #[error("Published but failed to reschedule: {0}")]
    Reschedule(#[source] StoreError),
}

/// Conditions that stop the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Offset commits failing persistently ({failures} in a row): {last}")]
    CommitUnavailable { failures: u32, last: String },

    #[error("Results could not be published for {stranded} message(s), offsets are pinned: {last}")]
    PublishUnavailable { stranded: u32, last: String },
}
