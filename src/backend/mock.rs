use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    backend::{BackendConfig, ModelSource, RawChunkStream, UpstreamClient, UpstreamError},
    models::ChatRequest,
};

/// In-process upstream that replays a fixed script. Every call is recorded so
/// tests can assert on call counts and connection release.
#[derive(Debug, Clone)]
pub struct ScriptedUpstream {
    open: Result<Vec<String>, UpstreamError>,
    tail_error: Option<UpstreamError>,
    once: Result<String, UpstreamError>,
    models: Result<Vec<String>, UpstreamError>,
    open_delay: Duration,
    chunk_delay: Duration,
    hold_open: bool,
    calls: Arc<CallLog>,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self {
            open: Ok(Vec::new()),
            tail_error: None,
            once: Ok(String::new()),
            models: Ok(Vec::new()),
            open_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            hold_open: false,
            calls: Arc::new(CallLog::default()),
        }
    }
}

#[derive(Debug, Default)]
pub struct CallLog {
    stream_calls: AtomicUsize,
    once_calls: AtomicUsize,
    model_calls: AtomicUsize,
    released: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl CallLog {
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn once_calls(&self) -> usize {
        self.once_calls.load(Ordering::SeqCst)
    }

    pub fn model_calls(&self) -> usize {
        self.model_calls.load(Ordering::SeqCst)
    }

    /// Streams whose producer has finished, either by draining or because
    /// the consumer dropped them.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &ChatRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }
}

struct ReleaseGuard(Arc<CallLog>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw framing units, replayed verbatim.
    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.open = Ok(chunks.into_iter().map(Into::into).collect());
        self
    }

    /// NDJSON lines in the `/api/generate` shape, closed by a `done` line.
    pub fn with_tokens(self, tokens: &[&str]) -> Self {
        let mut lines = tokens
            .iter()
            .map(|token| serde_json::json!({"response": token, "done": false}).to_string())
            .collect::<Vec<_>>();
        lines.push(r#"{"response":"","done":true}"#.to_owned());
        self.with_chunks(lines)
    }

    pub fn failing_open(mut self, error: UpstreamError) -> Self {
        self.open = Err(error);
        self
    }

    pub fn with_tail_error(mut self, error: UpstreamError) -> Self {
        self.tail_error = Some(error);
        self
    }

    pub fn with_once(mut self, once: Result<String, UpstreamError>) -> Self {
        self.once = once;
        self
    }

    pub fn with_models(mut self, models: Result<Vec<String>, UpstreamError>) -> Self {
        self.models = models;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Keep the connection open after the script runs out, like a model that
    /// never finishes.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn calls(&self) -> Arc<CallLog> {
        self.calls.clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn open_stream(&self, request: &ChatRequest) -> Result<RawChunkStream, UpstreamError> {
        self.calls.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.calls.record(request);
        sleep(self.open_delay).await;

        let chunks = self.open.clone()?;
        let tail_error = self.tail_error.clone();
        let delay = self.chunk_delay;
        let hold_open = self.hold_open;
        let guard = ReleaseGuard(self.calls.clone());
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let _guard = guard;
            for chunk in chunks {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = sleep(delay) => {}
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = tail_error {
                let _ = tx.send(Err(error)).await;
                return;
            }
            if hold_open {
                tx.closed().await;
            }
        });

        debug!(model = %request.model, "scripted stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn call_once(&self, request: &ChatRequest) -> Result<String, UpstreamError> {
        self.calls.once_calls.fetch_add(1, Ordering::SeqCst);
        self.calls.record(request);
        sleep(self.open_delay).await;
        self.once.clone()
    }
}

#[async_trait]
impl ModelSource for ScriptedUpstream {
    async fn list_models(&self, _backend: &BackendConfig) -> Result<Vec<String>, UpstreamError> {
        self.calls.model_calls.fetch_add(1, Ordering::SeqCst);
        self.models.clone()
    }
}
