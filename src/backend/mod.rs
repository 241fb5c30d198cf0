pub mod http;
pub mod mock;
pub mod wire;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ChatRequest;
use wire::WireFormat;

/// One framing unit of an upstream body, already split on line boundaries.
pub type RawChunkStream = BoxStream<'static, Result<String, UpstreamError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ollama,
    Lmstudio,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Ollama, BackendKind::Lmstudio];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::Lmstudio => "lmstudio",
        }
    }

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        descriptor(*self)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown backend: {value}"))
    }
}

/// Static knowledge about a backend kind. Adding a backend means adding an
/// entry here and a [`WireFormat`] variant; the relay never matches on kinds.
#[derive(Debug)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub default_base_url: &'static str,
    pub wire: WireFormat,
}

static REGISTRY: [BackendDescriptor; 2] = [
    BackendDescriptor {
        kind: BackendKind::Ollama,
        default_base_url: "http://127.0.0.1:11434",
        wire: WireFormat::OllamaGenerate,
    },
    BackendDescriptor {
        kind: BackendKind::Lmstudio,
        default_base_url: "http://127.0.0.1:1234",
        wire: WireFormat::OpenAiChat,
    },
];

pub fn descriptor(kind: BackendKind) -> &'static BackendDescriptor {
    match kind {
        BackendKind::Ollama => &REGISTRY[0],
        BackendKind::Lmstudio => &REGISTRY[1],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
}

impl BackendConfig {
    /// Picks the first non-blank candidate URL, falling back to the registry default.
    pub fn resolve<'a>(kind: BackendKind, candidates: impl IntoIterator<Item = &'a str>) -> Self {
        let base_url = candidates
            .into_iter()
            .map(|candidate| candidate.trim().trim_end_matches('/'))
            .find(|candidate| !candidate.is_empty())
            .unwrap_or(kind.descriptor().default_base_url)
            .to_owned();
        Self { kind, base_url }
    }

    pub fn wire(&self) -> WireFormat {
        self.kind.descriptor().wire
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Issues outbound calls to a model server. Implementations own exactly one
/// connection per call; dropping the returned stream releases it.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<RawChunkStream, UpstreamError>;
    async fn call_once(&self, request: &ChatRequest) -> Result<String, UpstreamError>;
}

#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn list_models(&self, backend: &BackendConfig) -> Result<Vec<String>, UpstreamError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend rejected request with status {status}: {}", preview(.body))]
    Rejected { status: u16, body: String },
    #[error("backend stream interrupted: {0}")]
    Interrupted(String),
    #[error("backend returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// Error bodies are kept verbatim on the variant; only the rendered message is capped.
fn preview(body: &str) -> String {
    const LIMIT: usize = 400;
    let trimmed = body.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_owned();
    }
    let mut preview = trimmed.chars().take(LIMIT).collect::<String>();
    preview.push_str("...");
    preview
}

impl UpstreamError {
    pub fn stage(&self) -> &'static str {
        match self {
            UpstreamError::Unreachable(_) => "unreachable",
            UpstreamError::Rejected { .. } => "rejected",
            UpstreamError::Interrupted(_) => "interrupted",
            UpstreamError::MalformedResponse(_) => "malformed_response",
        }
    }
}
