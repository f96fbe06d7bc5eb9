//! Per-attempt state machine.
//!
//! Every input that can end or advance a measurement (transport progress,
//! the three timers, external cancellation) arrives as an [`Event`]; the
//! transition table lives in [`Attempt::on`] and the first terminal event
//! wins. Later events are ignored.

use crate::model::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    HeadersReceived,
    StreamingBody,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HeadersReceived,
    /// A body chunk arrived; `total` is the decoded size so far
    Chunk { total: usize },
    BodyEnd,
    TransportError { kind: ErrorKind, detail: String },
    OverallTimerFired,
    IdleTimerFired,
    Cancelled,
}

/// What the driver should do after feeding an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep reading; restart the idle timer when asked
    Continue { rearm_idle: bool },
    Complete,
    Failed,
    /// The event did not apply in the current phase
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    phase: Phase,
    max_body: usize,
    failure: Option<(ErrorKind, Option<String>)>,
}

impl Attempt {
    pub fn new(max_body: usize) -> Self {
        Self { phase: Phase::Connecting, max_body, failure: None }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The idle timer only runs once headers are in
    pub fn idle_armed(&self) -> bool {
        matches!(self.phase, Phase::HeadersReceived | Phase::StreamingBody)
    }

    pub fn failure(&self) -> Option<&(ErrorKind, Option<String>)> {
        self.failure.as_ref()
    }

    pub fn into_failure(self) -> Option<(ErrorKind, Option<String>)> {
        self.failure
    }

    fn fail(&mut self, kind: ErrorKind, detail: Option<String>) -> Step {
        self.phase = Phase::Failed;
        self.failure = Some((kind, detail));
        Step::Failed
    }

    pub fn on(&mut self, event: Event) -> Step {
        use Phase::*;

        if self.phase.is_terminal() {
            return Step::Ignored;
        }

        match (self.phase, event) {
            (_, Event::Cancelled) => self.fail(ErrorKind::Aborted, Some("measurement cancelled".into())),
            (_, Event::OverallTimerFired) => {
                self.fail(ErrorKind::Timeout, Some("overall timeout budget exhausted".into()))
            }
            (_, Event::TransportError { kind, detail }) => self.fail(kind, Some(detail)),

            (Connecting, Event::HeadersReceived) => {
                self.phase = HeadersReceived;
                Step::Continue { rearm_idle: true }
            }
            (Connecting, Event::IdleTimerFired) => Step::Ignored,
            (Connecting, Event::Chunk { .. } | Event::BodyEnd) => {
                self.fail(ErrorKind::Transport, Some("body data before response headers".into()))
            }

            (HeadersReceived | StreamingBody, Event::HeadersReceived) => Step::Ignored,
            (HeadersReceived | StreamingBody, Event::Chunk { total }) => {
                if total > self.max_body {
                    return self.fail(
                        ErrorKind::MaxBodyExceeded,
                        Some(format!("response body exceeded {} bytes", self.max_body)),
                    );
                }
                self.phase = StreamingBody;
                Step::Continue { rearm_idle: true }
            }
            (HeadersReceived | StreamingBody, Event::BodyEnd) => {
                self.phase = Complete;
                Step::Complete
            }
            (HeadersReceived | StreamingBody, Event::IdleTimerFired) => {
                self.fail(ErrorKind::Timeout, Some("response stalled".into()))
            }

            (Complete | Failed, _) => Step::Ignored,
        }
    }
}
