use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status code reported on the wire when no HTTP status could be obtained.
pub const SENTINEL_STATUS: u16 = 599;

/// One row of the endpoint configuration table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Endpoint URL, unique across active rows
    pub id: String,
    pub active: bool,
    pub interval: Duration,
    pub expected_status: u16,
    pub updated_at: DateTime<Utc>,
}

impl EndpointConfig {
    /// Create an active endpoint with the given check interval
    pub fn new(id: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            active: true,
            interval,
            expected_status: 200,
            updated_at: Utc::now(),
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    /// Next due time for a dispatch happening at `now` (Unix seconds).
    ///
    /// Intervals under a second are clamped so an entry can never stay due
    /// forever.
    pub fn next_due(&self, now: i64) -> i64 {
        now + self.interval.as_secs().max(1) as i64
    }
}

/// A (score, member) pair of the due-time index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Absolute Unix time in seconds when the member is next due
    pub score: i64,
    pub member: String,
}

impl ScheduleEntry {
    pub fn new(member: impl Into<String>, score: i64) -> Self {
        Self { score, member: member.into() }
    }
}

/// Queue payload asking a probe worker to measure one endpoint.
///
/// The endpoint travels as the message key; everything else is an optional
/// override carried as JSON in the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {
    #[serde(skip)]
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,

    /// Unix seconds at which the scheduler dispatched the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,
}

impl ProbeMessage {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Default::default() }
    }

    pub fn scheduled_at(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expected_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Encode the value part of the queue message
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Rebuild a message from a queue key and value.
    ///
    /// The key is authoritative for the target. A value that is not a JSON
    /// object (older producers sent a bare status marker) is ignored.
    pub fn from_parts(key: &str, value: Option<&[u8]>) -> Self {
        let mut message = value
            .and_then(|bytes| serde_json::from_slice::<ProbeMessage>(bytes).ok())
            .unwrap_or_default();
        message.endpoint = key.to_string();
        message
    }
}

/// Classified reason why a measurement did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionRefused,
    DnsNotFound,
    /// TCP-level or connect-phase timeout
    ConnectTimeout,
    HostUnreachable,
    /// Overall or response/idle timeout
    Timeout,
    MaxBodyExceeded,
    Tls,
    Transport,
    Aborted,
    /// Anything else, keeping the underlying code for diagnosis
    Unknown(String),
}

impl ErrorKind {
    pub fn code(&self) -> &str {
        match self {
            ErrorKind::ConnectionRefused => "ECONNREFUSED",
            ErrorKind::DnsNotFound => "DNS_NOT_FOUND",
            ErrorKind::ConnectTimeout => "TCP_TIMEOUT",
            ErrorKind::HostUnreachable => "HOST_UNREACHABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::MaxBodyExceeded => "MAX_BODY_EXCEEDED",
            ErrorKind::Tls => "TLS_ERROR",
            ErrorKind::Transport => "HTTP_ERROR",
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::Unknown(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "ECONNREFUSED" => ErrorKind::ConnectionRefused,
            "DNS_NOT_FOUND" | "ENOTFOUND" => ErrorKind::DnsNotFound,
            "TCP_TIMEOUT" | "ETIMEDOUT" => ErrorKind::ConnectTimeout,
            "HOST_UNREACHABLE" | "EHOSTUNREACH" => ErrorKind::HostUnreachable,
            "TIMEOUT" => ErrorKind::Timeout,
            "MAX_BODY_EXCEEDED" => ErrorKind::MaxBodyExceeded,
            "TLS_ERROR" => ErrorKind::Tls,
            "HTTP_ERROR" => ErrorKind::Transport,
            "ABORTED" => ErrorKind::Aborted,
            other => ErrorKind::Unknown(other.to_string()),
        }
    }

    /// Timeouts of any tier
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::ConnectTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorKind::from_code(&code))
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
}

/// Outcome of one HTTP attempt. Built once by the measurement engine.
#[derive(Debug, Clone, Serialize)]
pub struct MeasureResult {
    pub ok: bool,
    pub url: String,
    /// Wall-clock time the attempt finished
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl MeasureResult {
    /// A response was obtained; `ok` follows the status policy.
    pub fn responded(url: impl Into<String>, duration: Duration, status: u16) -> Self {
        Self {
            ok: is_success_status(status),
            url: url.into(),
            timestamp: Utc::now(),
            duration,
            status: Some(status),
            status_text: None,
            headers: None,
            body: None,
            error: None,
            error_detail: None,
        }
    }

    /// No response was obtained.
    pub fn failed(
        url: impl Into<String>,
        duration: Duration,
        error: ErrorKind,
        detail: Option<String>,
    ) -> Self {
        Self {
            ok: false,
            url: url.into(),
            timestamp: Utc::now(),
            duration,
            status: None,
            status_text: None,
            headers: None,
            body: None,
            error: Some(error),
            error_detail: detail,
        }
    }

    pub fn with_status_text(mut self, text: Option<String>) -> Self {
        self.status_text = text;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// HTTP status, or [`SENTINEL_STATUS`] when none was obtained
    pub fn status_or_sentinel(&self) -> u16 {
        self.status.unwrap_or(SENTINEL_STATUS)
    }
}

/// Success policy shared by the probe and the aggregation side: 2xx and 3xx.
///
/// Redirects are not followed, so a 3xx is what the endpoint answered.
pub fn is_success_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Identity stamped on every result record by a probe process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeIdentity {
    pub probe_id: String,
    pub region: String,
}

/// The record published downstream for every processed probe message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Unix milliseconds when the measurement finished
    pub event_time_ms: i64,
    pub probe_id: String,
    pub region: String,
    pub status_code: u16,
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    /// Time between receiving the queue message and building the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_latency_ms: Option<u64>,
}

impl ResultRecord {
    pub fn from_measurement(
        result: &MeasureResult,
        message: &ProbeMessage,
        identity: &ProbeIdentity,
    ) -> Self {
        Self {
            event_time_ms: result.timestamp.timestamp_millis(),
            probe_id: identity.probe_id.clone(),
            region: identity.region.clone(),
            status_code: result.status_or_sentinel(),
            ok: result.ok,
            latency_ms: result.duration_ms(),
            error_kind: result.error.clone(),
            error_detail: result.error_detail.clone(),
            endpoint_id: message.endpoint.clone(),
            expected_status: message.expected_status,
            processing_latency_ms: None,
        }
    }

    pub fn with_processing_latency(mut self, elapsed: Duration) -> Self {
        self.processing_latency_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.event_time_ms)
    }
}
