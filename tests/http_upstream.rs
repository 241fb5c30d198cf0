use std::sync::Arc;

use futures_util::StreamExt;
use local_relay::{
    backend::{
        http::{HttpUpstream, UpstreamConfig},
        BackendConfig, BackendKind, ModelSource, UpstreamClient, UpstreamError,
    },
    events::CanonicalEvent,
    history::HistoryLog,
    metrics::AppMetrics,
    models::{ChatRequest, ChatTurn, Role, SamplingParams},
    relay::Relay,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn upstream() -> HttpUpstream {
    HttpUpstream::new(UpstreamConfig::default()).expect("client build")
}

fn request(kind: BackendKind, base_url: &str) -> ChatRequest {
    ChatRequest {
        backend: BackendConfig::resolve(kind, [base_url]),
        model: "llama3".to_owned(),
        turns: vec![
            ChatTurn::new(Role::System, "be brief"),
            ChatTurn::new(Role::User, "hi"),
        ],
        sampling: SamplingParams {
            temperature: 0.5,
            top_p: 0.9,
            max_tokens: 64,
        },
    }
}

async fn collect_lines(client: &HttpUpstream, request: &ChatRequest) -> Vec<String> {
    client
        .open_stream(request)
        .await
        .expect("stream opens")
        .map(|line| line.expect("line"))
        .collect()
        .await
}

#[tokio::test]
async fn ollama_stream_posts_generate_and_yields_ndjson_lines() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"response\":\"Hel\",\"done\":false}\n",
        "{\"response\":\"lo\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":true}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "llama3",
            "stream": true,
            "prompt": "SYSTEM: be brief\nUSER: hi\nASSISTANT:",
            "options": {"num_predict": 64},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let lines = collect_lines(&upstream(), &request(BackendKind::Ollama, &server.uri())).await;

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], r#"{"response":"Hel","done":false}"#);
}

#[tokio::test]
async fn lmstudio_stream_posts_chat_completions_and_yields_sse_lines() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n",
        "\r\n",
        "data: [DONE]\r\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "model": "llama3",
            "stream": true,
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
            ],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let lines = collect_lines(&upstream(), &request(BackendKind::Lmstudio, &server.uri())).await;

    assert_eq!(
        lines,
        vec![
            r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
            "",
            "data: [DONE]",
        ]
    );
}

#[tokio::test]
async fn non_success_status_is_rejected_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model 'llama3' not found"))
        .mount(&server)
        .await;

    let result = upstream()
        .open_stream(&request(BackendKind::Ollama, &server.uri()))
        .await;

    match result {
        Err(UpstreamError::Rejected { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "model 'llama3' not found");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected rejection"),
    }
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    let result = upstream()
        .call_once(&request(BackendKind::Lmstudio, "http://127.0.0.1:1"))
        .await;

    assert!(matches!(result, Err(UpstreamError::Unreachable(_))));
}

#[tokio::test]
async fn call_once_extracts_text_per_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3",
            "response": "from ollama",
            "done": true,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "from lmstudio"}}],
        })))
        .mount(&server)
        .await;

    let client = upstream();
    let ollama = client
        .call_once(&request(BackendKind::Ollama, &server.uri()))
        .await
        .expect("ollama call");
    let lmstudio = client
        .call_once(&request(BackendKind::Lmstudio, &server.uri()))
        .await
        .expect("lmstudio call");

    assert_eq!(ollama, "from ollama");
    assert_eq!(lmstudio, "from lmstudio");
}

#[tokio::test]
async fn list_models_reads_each_backend_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "llama3:8b"}, {"name": "qwen2:7b"}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{"id": "phi-3-mini"}],
        })))
        .mount(&server)
        .await;

    let client = upstream();
    let ollama = client
        .list_models(&BackendConfig::resolve(BackendKind::Ollama, [server.uri().as_str()]))
        .await
        .expect("ollama models");
    let lmstudio = client
        .list_models(&BackendConfig::resolve(BackendKind::Lmstudio, [server.uri().as_str()]))
        .await
        .expect("lmstudio models");

    assert_eq!(ollama, vec!["llama3:8b", "qwen2:7b"]);
    assert_eq!(lmstudio, vec!["phi-3-mini"]);
}

#[tokio::test]
async fn relay_falls_back_when_backend_rejects_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(500).set_body_string("streaming unsupported"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "whole answer",
            "done": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let relay = Relay::new(
        Arc::new(upstream()),
        Arc::new(AppMetrics::new()),
        HistoryLog::disabled(),
    );
    let events = relay
        .handle(
            "wire-fallback",
            request(BackendKind::Ollama, &server.uri()),
            CancellationToken::new(),
        )
        .collect::<Vec<_>>()
        .await;

    assert!(events.contains(&CanonicalEvent::Delta("whole answer".to_owned())));
    assert!(!events.iter().any(|event| matches!(event, CanonicalEvent::Error(_))));
    assert_eq!(events.last(), Some(&CanonicalEvent::End));
}
