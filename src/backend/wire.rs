use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    backend::UpstreamError,
    models::{ChatRequest, ChatTurn},
};

/// Native framing spoken by a backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `/api/generate`: newline-delimited JSON, `response` fragments, `done` flag.
    OllamaGenerate,
    /// `/v1/chat/completions`: SSE `data:` lines with OpenAI deltas, `[DONE]` sentinel.
    OpenAiChat,
}

/// Result of translating one raw framing unit. An empty, not-done frame is
/// framing noise (keep-alives, role-only deltas) and carries nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub text: String,
    pub done: bool,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),
}

impl WireFormat {
    pub fn chat_path(&self) -> &'static str {
        match self {
            WireFormat::OllamaGenerate => "/api/generate",
            WireFormat::OpenAiChat => "/v1/chat/completions",
        }
    }

    pub fn models_path(&self) -> &'static str {
        match self {
            WireFormat::OllamaGenerate => "/api/tags",
            WireFormat::OpenAiChat => "/v1/models",
        }
    }

    pub fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let sampling = &request.sampling;
        match self {
            WireFormat::OllamaGenerate => json!({
                "model": request.model,
                "prompt": flatten_prompt(&request.turns),
                "stream": stream,
                "options": {
                    "temperature": sampling.temperature,
                    "top_p": sampling.top_p,
                    "num_predict": sampling.max_tokens,
                }
            }),
            WireFormat::OpenAiChat => json!({
                "model": request.model,
                "messages": request
                    .turns
                    .iter()
                    .map(|turn| json!({"role": turn.role.as_str(), "content": turn.content}))
                    .collect::<Vec<_>>(),
                "stream": stream,
                "temperature": sampling.temperature,
                "top_p": sampling.top_p,
                "max_tokens": sampling.max_tokens,
            }),
        }
    }

    pub fn next_frame(&self, raw: &str) -> Result<Frame, TranslateError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(Frame::default());
        }

        match self {
            WireFormat::OllamaGenerate => {
                let chunk: OllamaChunk = serde_json::from_str(line)
                    .map_err(|error| TranslateError::MalformedChunk(error.to_string()))?;
                if let Some(message) = chunk.error {
                    return Err(TranslateError::MalformedChunk(format!(
                        "backend reported: {message}"
                    )));
                }
                Ok(Frame {
                    text: chunk.response.unwrap_or_default(),
                    done: chunk.done,
                })
            }
            WireFormat::OpenAiChat => {
                let Some(payload) = line.strip_prefix("data:") else {
                    return Ok(Frame::default());
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return Ok(Frame::done());
                }

                let parsed: OpenAiStreamResponse = serde_json::from_str(payload)
                    .map_err(|error| TranslateError::MalformedChunk(error.to_string()))?;
                let text = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .unwrap_or_default();
                Ok(Frame::text(text))
            }
        }
    }

    pub fn final_text(&self, body: &str) -> Result<String, UpstreamError> {
        let malformed = |error: serde_json::Error| UpstreamError::MalformedResponse(error.to_string());
        match self {
            WireFormat::OllamaGenerate => {
                let parsed: OllamaChunk = serde_json::from_str(body).map_err(malformed)?;
                parsed.response.ok_or_else(|| {
                    UpstreamError::MalformedResponse("missing `response` field".to_owned())
                })
            }
            WireFormat::OpenAiChat => {
                let parsed: OpenAiChatResponse = serde_json::from_str(body).map_err(malformed)?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .ok_or_else(|| {
                        UpstreamError::MalformedResponse(
                            "missing `choices[0].message.content` field".to_owned(),
                        )
                    })
            }
        }
    }

    pub fn parse_models(&self, body: &str) -> Result<Vec<String>, UpstreamError> {
        let malformed = |error: serde_json::Error| UpstreamError::MalformedResponse(error.to_string());
        let models = match self {
            WireFormat::OllamaGenerate => serde_json::from_str::<OllamaTags>(body)
                .map_err(malformed)?
                .models
                .into_iter()
                .filter_map(|entry| entry.name)
                .collect::<Vec<_>>(),
            WireFormat::OpenAiChat => serde_json::from_str::<OpenAiModelList>(body)
                .map_err(malformed)?
                .data
                .into_iter()
                .filter_map(|entry| entry.id)
                .collect::<Vec<_>>(),
        };
        Ok(models.into_iter().filter(|name| !name.is_empty()).collect())
    }
}

fn flatten_prompt(turns: &[ChatTurn]) -> String {
    let mut lines = turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role.as_str().to_uppercase(), turn.content))
        .collect::<Vec<_>>();
    lines.push("ASSISTANT:".to_owned());
    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    #[serde(default)]
    id: Option<String>,
}
