//! Request validation for probe targets.
//!
//! These are the only synchronous rejections the engine makes; anything that
//! goes wrong on the network is reported inside the result instead.

use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::error::ProbeError;
use crate::model::ProbeMessage;

pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);
pub const MAX_HEADERS: usize = 20;
pub const MAX_HEADER_SIZE: usize = 8192;

/// A validated measurement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub target: Url,
    pub method: Method,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Overall budget for the attempt
    pub timeout: Duration,
}

impl ProbeRequest {
    pub fn new(
        target: &str,
        method: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        Ok(Self {
            target: validate_url(target)?,
            method: validate_http_method(method)?,
            headers: validate_headers(headers)?,
            timeout: validate_timeout(timeout)?,
        })
    }

    /// Plain GET with the given budget
    pub fn get(target: &str, timeout: Duration) -> Result<Self, ProbeError> {
        Self::new(target, "GET", &[], timeout)
    }

    /// Build from a queue message, falling back to `default_timeout` when the
    /// message carries no override.
    pub fn from_message(message: &ProbeMessage, default_timeout: Duration) -> Result<Self, ProbeError> {
        let headers: Vec<(String, String)> = message
            .headers
            .as_ref()
            .map(|headers| headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let timeout = message.timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout);

        Self::new(&message.endpoint, message.method.as_deref().unwrap_or("GET"), &headers, timeout)
    }

    /// Host name used for connection pooling decisions
    pub fn host(&self) -> &str {
        self.target.host_str().unwrap_or_default()
    }
}

/// Validate URL format and scheme
fn validate_url(url: &str) -> Result<Url, ProbeError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ProbeError::EmptyTarget);
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| ProbeError::InvalidUrl { url: trimmed.to_string(), reason: e.to_string() })?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(ProbeError::UnsupportedScheme(other.to_string())),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ProbeError::InvalidUrl { url: trimmed.to_string(), reason: "missing host".into() });
    }

    Ok(parsed)
}

/// Validate HTTP method
fn validate_http_method(method: &str) -> Result<Method, ProbeError> {
    match method.trim().to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        "PATCH" => Ok(Method::PATCH),
        _ => Err(ProbeError::UnsupportedMethod(method.to_string())),
    }
}

/// Validate timeout value
fn validate_timeout(timeout: Duration) -> Result<Duration, ProbeError> {
    if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
        return Err(ProbeError::TimeoutOutOfBounds { actual: timeout, min: MIN_TIMEOUT, max: MAX_TIMEOUT });
    }
    Ok(timeout)
}

/// Validate headers
fn validate_headers(headers: &[(String, String)]) -> Result<Vec<(HeaderName, HeaderValue)>, ProbeError> {
    if headers.len() > MAX_HEADERS {
        return Err(ProbeError::TooManyHeaders { count: headers.len(), max: MAX_HEADERS });
    }

    headers
        .iter()
        .map(|(key, value)| {
            let size = key.len() + value.len();
            if size > MAX_HEADER_SIZE {
                return Err(ProbeError::HeaderTooLarge { name: key.clone(), size, max: MAX_HEADER_SIZE });
            }
            let name = HeaderName::from_bytes(key.trim().as_bytes())
                .map_err(|_| ProbeError::InvalidHeader(key.clone()))?;
            let value = HeaderValue::from_str(value).map_err(|_| ProbeError::InvalidHeader(key.clone()))?;
            Ok((name, value))
        })
        .collect()
}
