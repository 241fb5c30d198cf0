use serde::{Deserialize, Serialize};

use crate::{
    backend::{BackendConfig, BackendKind},
    settings::Settings,
};

pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Client-facing chat payload, shared by `/chat_stream` and `/chat_once`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub ollama_base_url: Option<String>,
    #[serde(default)]
    pub lmstudio_base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(default, alias = "text")]
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl SamplingParams {
    /// Each value falls back to `fallback` when absent, non-finite or out of range.
    pub fn resolve(
        temperature: Option<f64>,
        top_p: Option<f64>,
        max_tokens: Option<i64>,
        fallback: SamplingParams,
    ) -> Self {
        Self {
            temperature: finite(temperature).unwrap_or(fallback.temperature),
            top_p: finite(top_p).unwrap_or(fallback.top_p),
            max_tokens: max_tokens
                .filter(|value| *value > 0)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(fallback.max_tokens),
        }
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|number| number.is_finite())
}

/// Fully resolved, immutable chat request handed to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub backend: BackendConfig,
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub sampling: SamplingParams,
}

impl ChatPayload {
    /// Per-request values win over the settings snapshot. An empty model is
    /// kept as-is; the relay reports it.
    pub fn resolve(self, settings: &Settings) -> ChatRequest {
        let kind = self.backend.unwrap_or(settings.backend);
        let kind_override = match kind {
            BackendKind::Ollama => self.ollama_base_url.as_deref(),
            BackendKind::Lmstudio => self.lmstudio_base_url.as_deref(),
        };
        let backend = BackendConfig::resolve(
            kind,
            [
                self.base_url.as_deref().unwrap_or_default(),
                kind_override.unwrap_or_default(),
                settings.base_url_for(kind),
            ],
        );

        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(settings.model.trim())
            .to_owned();

        let sampling = SamplingParams::resolve(
            self.temperature,
            self.top_p,
            self.max_tokens,
            settings.sampling(),
        );

        ChatRequest {
            backend,
            model,
            turns: strip_placeholder(self.messages),
            sampling,
        }
    }
}

/// Drops the trailing empty assistant turn the client appends for the answer
/// being generated.
fn strip_placeholder(mut turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
    while turns
        .last()
        .is_some_and(|turn| turn.role == Role::Assistant && turn.content.trim().is_empty())
    {
        turns.pop();
    }
    turns
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnceResponse {
    pub backend: BackendKind,
    pub model: String,
    pub response: String,
}
