//! Per-request orchestration: one chat request in, one ordered sequence of
//! canonical events out.
//!
//! A session opens the backend's native stream, translates every raw chunk
//! into deltas, and falls back to a single non-streaming call when the
//! stream produced no text. Cancellation is observed at every suspension
//! point (opening, each chunk read, the fallback call) and never triggers
//! the fallback.

use std::{future::Future, sync::Arc, time::Instant};

use futures_util::{stream::BoxStream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{UpstreamClient, UpstreamError},
    events::{until_end, CanonicalEvent, Stage},
    history::{HistoryEntry, HistoryLog},
    metrics::AppMetrics,
    models::ChatRequest,
};

pub type EventStream = BoxStream<'static, CanonicalEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no model selected")]
    NoModelSelected,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    FallingBack,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::FallingBack => "falling_back",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    upstream: Arc<dyn UpstreamClient>,
    metrics: Arc<AppMetrics>,
    history: HistoryLog,
}

impl Relay {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        metrics: Arc<AppMetrics>,
        history: HistoryLog,
    ) -> Self {
        Self {
            upstream,
            metrics,
            history,
        }
    }

    /// Lazily relays one chat request. Nothing touches the network until the
    /// returned stream is polled, and dropping it releases the upstream
    /// connection on whatever path it is on.
    pub fn handle(
        &self,
        session_id: impl Into<String>,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> EventStream {
        let upstream = self.upstream.clone();
        let mut session = StreamSession::new(
            session_id.into(),
            request,
            cancel,
            self.metrics.clone(),
            self.history.clone(),
        );

        let events = async_stream::stream! {
            let _active = session.metrics.active_session();
            info!(
                session_id = %session.id,
                backend = %session.request.backend.kind,
                base_url = %session.request.backend.base_url,
                model = %session.request.model,
                turns = session.request.turns.len(),
                "relay session started"
            );

            if session.request.model.is_empty() {
                warn!(session_id = %session.id, "rejecting chat request without a model");
                yield CanonicalEvent::Error(RelayError::NoModelSelected.to_string());
                session.finish(SessionState::Failed, false);
            } else {
                yield CanonicalEvent::Status(Stage::Connecting);
                let backend = session.request.backend.kind.as_str();
                let mut failure: Option<String> = None;

                let opened = session.until_cancelled(upstream.open_stream(&session.request)).await;
                match opened {
                    None => {}
                    Some(Err(error)) => {
                        warn!(session_id = %session.id, error = %error, "stream open failed, will try fallback");
                        session.metrics.observe_upstream_error(backend, "open", error.stage());
                        failure = Some(error.to_string());
                        yield CanonicalEvent::Status(Stage::Error);
                    }
                    Some(Ok(mut chunks)) => {
                        yield CanonicalEvent::Status(Stage::Connected);
                        let wire = session.request.backend.wire();

                        loop {
                            let Some(next) = session.until_cancelled(chunks.next()).await else {
                                break;
                            };
                            let raw = match next {
                                Some(Ok(raw)) => raw,
                                Some(Err(error)) => {
                                    warn!(session_id = %session.id, error = %error, "upstream stream failed mid-flight");
                                    session.metrics.observe_upstream_error(backend, "stream", error.stage());
                                    failure = Some(error.to_string());
                                    break;
                                }
                                None => break,
                            };

                            if session.state == SessionState::Connecting {
                                session.transition(SessionState::Streaming);
                                yield CanonicalEvent::Status(Stage::Streaming);
                            }
                            if session.cancel.is_cancelled() {
                                break;
                            }

                            match wire.next_frame(&raw) {
                                Ok(frame) => {
                                    if !frame.text.is_empty() {
                                        session.buffer.push_str(&frame.text);
                                        yield CanonicalEvent::Delta(frame.text);
                                    }
                                    if frame.done {
                                        break;
                                    }
                                }
                                Err(error) => {
                                    debug!(session_id = %session.id, error = %error, "skipping malformed chunk");
                                }
                            }
                        }
                        drop(chunks);
                        debug!(session_id = %session.id, chars = session.buffer.len(), "upstream stream closed");
                    }
                }

                if session.cancel.is_cancelled() {
                    session.finish(SessionState::Cancelled, true);
                } else if !session.buffer.is_empty() {
                    match failure {
                        Some(message) => {
                            yield CanonicalEvent::Error(message);
                            session.finish(SessionState::Failed, true);
                        }
                        None => session.finish(SessionState::Completed, true),
                    }
                } else {
                    session.transition(SessionState::FallingBack);
                    info!(session_id = %session.id, "stream produced no text, issuing non-streaming fallback");

                    let fallback = session.until_cancelled(upstream.call_once(&session.request)).await;
                    match fallback {
                        None => session.finish(SessionState::Cancelled, true),
                        Some(Ok(text)) => {
                            session.metrics.observe_fallback(backend, "success");
                            if !text.is_empty() {
                                session.buffer.push_str(&text);
                                yield CanonicalEvent::Delta(text);
                                session.finish(SessionState::Completed, true);
                            } else if let Some(message) = failure {
                                yield CanonicalEvent::Error(message);
                                session.finish(SessionState::Failed, true);
                            } else {
                                session.finish(SessionState::Completed, true);
                            }
                        }
                        Some(Err(error)) => {
                            warn!(session_id = %session.id, error = %error, "fallback call failed");
                            session.metrics.observe_fallback(backend, "failure");
                            session.metrics.observe_upstream_error(backend, "once", error.stage());
                            yield CanonicalEvent::Error(failure.unwrap_or_else(|| error.to_string()));
                            session.finish(SessionState::Failed, true);
                        }
                    }
                }
            }

            yield CanonicalEvent::End;
        };

        until_end(events).boxed()
    }

    /// The synchronous entry point: one non-streaming call, no fallback.
    pub async fn call_once(&self, request: &ChatRequest) -> Result<String, RelayError> {
        if request.model.is_empty() {
            return Err(RelayError::NoModelSelected);
        }

        let backend = request.backend.kind.as_str();
        let started = Instant::now();
        match self.upstream.call_once(request).await {
            Ok(text) => {
                debug!(
                    backend,
                    model = %request.model,
                    chars = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "non-streaming call completed"
                );
                self.history
                    .record(HistoryEntry::new(request, Some(text.clone())));
                Ok(text)
            }
            Err(error) => {
                warn!(backend, model = %request.model, error = %error, "non-streaming call failed");
                self.metrics.observe_upstream_error(backend, "once", error.stage());
                Err(error.into())
            }
        }
    }
}

/// State owned by exactly one in-flight request. Nothing in here is shared
/// with other sessions. A session dropped before it finished (the client
/// went away mid-stream) is recorded as cancelled with whatever text it had.
struct StreamSession {
    id: String,
    request: ChatRequest,
    cancel: CancellationToken,
    buffer: String,
    state: SessionState,
    started: Instant,
    finished: bool,
    metrics: Arc<AppMetrics>,
    history: HistoryLog,
}

impl StreamSession {
    fn new(
        id: String,
        request: ChatRequest,
        cancel: CancellationToken,
        metrics: Arc<AppMetrics>,
        history: HistoryLog,
    ) -> Self {
        Self {
            id,
            request,
            cancel,
            buffer: String::new(),
            state: SessionState::Connecting,
            started: Instant::now(),
            finished: false,
            metrics,
            history,
        }
    }

    fn finish(&mut self, state: SessionState, record: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.transition(state);
        let elapsed = self.started.elapsed();
        self.metrics
            .observe_session(self.request.backend.kind.as_str(), state.as_str(), elapsed);
        info!(
            session_id = %self.id,
            outcome = state.as_str(),
            chars = self.buffer.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "relay session finished"
        );
        if record {
            let response = Some(self.buffer.clone()).filter(|text| !text.is_empty());
            self.history
                .record(HistoryEntry::new(&self.request, response));
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "session state changed"
        );
        self.state = next;
    }

    /// Races `future` against cancellation; cancellation wins ties.
    async fn until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.finished {
            let record = !self.request.model.is_empty();
            self.finish(SessionState::Cancelled, record);
        }
    }
}
