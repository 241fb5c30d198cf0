use std::{env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use crate::{
    backend::{BackendConfig, ModelSource, RawChunkStream, UpstreamClient, UpstreamError},
    models::ChatRequest,
};

#[derive(Debug, Clone, Copy)]
pub struct UpstreamConfig {
    /// Bounds only the TCP/TLS handshake; streaming reads are unbounded.
    pub connect_timeout: Duration,
    pub once_timeout: Duration,
    pub models_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            once_timeout: Duration::from_secs(300),
            models_timeout: Duration::from_secs(20),
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: read_secs("RELAY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            once_timeout: read_secs("RELAY_ONCE_TIMEOUT_SECS", defaults.once_timeout),
            models_timeout: read_secs("RELAY_MODELS_TIMEOUT_SECS", defaults.models_timeout),
        }
    }
}

fn read_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// reqwest-backed client for local model servers.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| format!("failed to build upstream HTTP client: {error}"))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, String> {
        Self::new(UpstreamConfig::from_env())
    }

    async fn post_chat(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let wire = request.backend.wire();
        let url = request.backend.url(wire.chat_path());
        let mut builder = self
            .client
            .post(&url)
            .json(&wire.request_body(request, stream));
        if !stream {
            builder = builder.timeout(self.config.once_timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| UpstreamError::Unreachable(error.to_string()))?;
        debug!(
            backend = %request.backend.kind,
            %url,
            stream,
            status = response.status().as_u16(),
            "upstream responded"
        );
        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn open_stream(&self, request: &ChatRequest) -> Result<RawChunkStream, UpstreamError> {
        let response = self.post_chat(request, true).await?;
        Ok(into_lines(response))
    }

    async fn call_once(&self, request: &ChatRequest) -> Result<String, UpstreamError> {
        let response = self.post_chat(request, false).await?;
        let body = response
            .text()
            .await
            .map_err(|error| UpstreamError::Interrupted(error.to_string()))?;
        request.backend.wire().final_text(&body)
    }
}

#[async_trait]
impl ModelSource for HttpUpstream {
    async fn list_models(&self, backend: &BackendConfig) -> Result<Vec<String>, UpstreamError> {
        let wire = backend.wire();
        let response = self
            .client
            .get(backend.url(wire.models_path()))
            .timeout(self.config.models_timeout)
            .send()
            .await
            .map_err(|error| UpstreamError::Unreachable(error.to_string()))?;
        let body = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(|error| UpstreamError::Interrupted(error.to_string()))?;
        wire.parse_models(&body)
    }
}

/// Re-frames a response body into lines. The connection lives inside the
/// returned stream and is closed when the stream is dropped.
fn into_lines(response: reqwest::Response) -> RawChunkStream {
    let mut upstream = response.bytes_stream();
    let stream = async_stream::stream! {
        let mut lines = LineBuffer::default();
        let mut interrupted = false;

        while let Some(next) = upstream.next().await {
            match next {
                Ok(bytes) => {
                    for line in lines.push(&bytes) {
                        yield Ok(line);
                    }
                }
                Err(error) => {
                    yield Err(UpstreamError::Interrupted(error.to_string()));
                    interrupted = true;
                    break;
                }
            }
        }

        if !interrupted {
            if let Some(rest) = lines.finish() {
                yield Ok(rest);
            }
        }
    };
    stream.boxed()
}

/// Splits on `\n` at the byte level so multi-byte characters straddling two
/// network reads survive intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=index).collect::<Vec<_>>();
            lines.push(decode_line(&line[..index]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_owned()
}
