use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use reqwest::Response;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::attempt::{Attempt, Event, Step};
use super::body::{BodyAccumulator, BodyError, ContentEncoding, parse_body};
use super::classify::classify;
use super::connection::ConnectionManager;
use super::validation::ProbeRequest;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::model::{ErrorKind, MeasureResult};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_body: usize,
    /// Body stall guard; `None` uses the request's own budget
    pub idle_timeout: Option<Duration>,
    pub user_agent: String,
}

impl From<&ProbeConfig> for EngineSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_body: config.max_body_bytes,
            idle_timeout: config.response_idle_timeout_ms.map(Duration::from_millis),
            user_agent: config.user_agent.clone(),
        }
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

type SendFuture = Pin<Box<dyn Future<Output = Result<Response, reqwest::Error>> + Send>>;

/// Where the transport side of one attempt stands.
enum Transfer {
    Sending(SendFuture),
    Receiving { response: Response, body: BodyAccumulator },
    Finished,
}

/// What the transport produced for a completed response.
#[derive(Default)]
struct Received {
    status: Option<reqwest::StatusCode>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl Transfer {
    /// Drive the transport to its next event. Only ever interrupted by a
    /// terminal event, so no partially read chunk is lost.
    async fn next_event(&mut self, received: &mut Received, max_body: usize) -> Event {
        match self {
            Transfer::Sending(send) => match send.await {
                Ok(response) => {
                    let encoding =
                        ContentEncoding::from_header(header_str(response.headers(), CONTENT_ENCODING));
                    received.content_type = header_str(response.headers(), CONTENT_TYPE).map(str::to_string);
                    received.status = Some(response.status());
                    received.headers = response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
                        })
                        .collect();

                    *self = Transfer::Receiving { response, body: BodyAccumulator::new(encoding, max_body) };
                    Event::HeadersReceived
                }
                Err(error) => {
                    *self = Transfer::Finished;
                    let (kind, detail) = classify(&error);
                    Event::TransportError { kind, detail }
                }
            },
            Transfer::Receiving { response, body } => match response.chunk().await {
                Ok(Some(chunk)) => match body.push(&chunk) {
                    Ok(total) => Event::Chunk { total },
                    Err(BodyError::Exceeded { .. }) => Event::Chunk { total: body.decoded_len() },
                    Err(BodyError::Decode(detail)) => Event::TransportError {
                        kind: ErrorKind::Transport,
                        detail: format!("failed to decode response body: {detail}"),
                    },
                },
                Ok(None) => {
                    let Transfer::Receiving { body, .. } = std::mem::replace(self, Transfer::Finished) else {
                        return Event::BodyEnd;
                    };
                    match body.finish() {
                        Ok(bytes) => {
                            received.body = bytes;
                            Event::BodyEnd
                        }
                        Err(BodyError::Exceeded { limit }) => Event::Chunk { total: limit.saturating_add(1) },
                        Err(BodyError::Decode(detail)) => Event::TransportError {
                            kind: ErrorKind::Transport,
                            detail: format!("failed to decode response body: {detail}"),
                        },
                    }
                }
                Err(error) => {
                    let (kind, detail) = classify(&error);
                    Event::TransportError { kind, detail }
                }
            },
            Transfer::Finished => std::future::pending().await,
        }
    }
}

/// Performs one HTTP request/response cycle per call under the timeout
/// cascade, the body cap and external cancellation.
pub struct MeasurementEngine {
    connections: Arc<ConnectionManager>,
    settings: EngineSettings,
}

impl MeasurementEngine {
    pub fn new(connections: Arc<ConnectionManager>, settings: EngineSettings) -> Self {
        Self { connections, settings }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn request_headers(&self, request: &ProbeRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        if let Ok(agent) = HeaderValue::from_str(&self.settings.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    /// Validate and measure in one step
    pub async fn measure_target(
        &self,
        target: &str,
        method: &str,
        headers: &[(String, String)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<MeasureResult, ProbeError> {
        let request = ProbeRequest::new(target, method, headers, timeout)?;
        self.measure(&request, cancel).await
    }

    /// Measure one request. Network failures, timeouts, the body cap and
    /// cancellation all come back as a failed [`MeasureResult`]; `Err` only
    /// means no HTTP client could be built.
    pub async fn measure(
        &self,
        request: &ProbeRequest,
        cancel: &CancellationToken,
    ) -> Result<MeasureResult, ProbeError> {
        let started = Instant::now();
        let url = request.target.to_string();
        let idle_timeout = self.settings.idle_timeout.unwrap_or(request.timeout);

        let lease = self.connections.lease(&request.target)?;
        let send = lease
            .client
            .request(request.method.clone(), request.target.clone())
            .headers(self.request_headers(request))
            .send();

        let mut transfer = Transfer::Sending(Box::pin(send));
        let mut received = Received::default();
        let mut attempt = Attempt::new(self.settings.max_body);

        let overall = sleep(request.timeout);
        let idle = sleep(idle_timeout);
        tokio::pin!(overall, idle);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                _ = &mut overall => Event::OverallTimerFired,
                _ = &mut idle, if attempt.idle_armed() => Event::IdleTimerFired,
                event = transfer.next_event(&mut received, self.settings.max_body) => event,
            };

            match attempt.on(event) {
                Step::Continue { rearm_idle: true } => idle.as_mut().reset(Instant::now() + idle_timeout),
                Step::Continue { rearm_idle: false } | Step::Ignored => {}
                Step::Complete | Step::Failed => break,
            }
        }
        drop(transfer);

        let duration = started.elapsed();
        let result = match attempt.into_failure() {
            Some((kind, detail)) => {
                debug!(url = %url, error = %kind, duration_ms = duration.as_millis() as u64, pooled = lease.pooled, "Measurement failed");
                MeasureResult::failed(url, duration, kind, detail)
            }
            None => {
                let status = received.status.map(|status| status.as_u16()).unwrap_or_default();
                let reason = received
                    .status
                    .and_then(|status| status.canonical_reason())
                    .map(str::to_string);
                debug!(url = %url, status, duration_ms = duration.as_millis() as u64, pooled = lease.pooled, "Measurement complete");

                let result = MeasureResult::responded(url, duration, status)
                    .with_status_text(reason)
                    .with_headers(received.headers);
                match parse_body(received.content_type.as_deref(), &received.body) {
                    Some(body) => result.with_body(body),
                    None => result,
                }
            }
        };

        Ok(result)
    }
}
