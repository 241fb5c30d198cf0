use std::{convert::Infallible, time::Instant};

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    backend::{BackendConfig, BackendKind},
    errors::AppError,
    events::into_sse,
    models::{ChatPayload, OnceResponse},
    settings::Settings,
    state::AppState,
};

pub const SESSION_HEADER: &str = "x-relay-session";

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = state.settings.snapshot().await;
    Json(json!({ "status": "ok", "settings": settings }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.snapshot().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub backend: BackendKind,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Always answers 200; listing failures travel in the `error` field so the
/// selection UI can show them inline.
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<ModelsResponse> {
    let settings = state.settings.snapshot().await;
    let kind = query.backend.unwrap_or(settings.backend);
    let backend = BackendConfig::resolve(
        kind,
        [
            query.base_url.as_deref().unwrap_or_default(),
            settings.base_url_for(kind),
        ],
    );

    let response = match state.catalog.models(&backend, query.refresh).await {
        Ok(entry) => ModelsResponse {
            backend: kind,
            models: entry.models.clone(),
            error: None,
        },
        Err(error) => ModelsResponse {
            backend: kind,
            models: Vec::new(),
            error: Some(error.to_string()),
        },
    };
    Json(response)
}

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Response {
    let started = Instant::now();
    let settings = state.settings.snapshot().await;
    let request = payload.resolve(&settings);
    let handle = state.sessions.register();
    let session_id = handle.id().to_owned();

    info!(
        session_id = %session_id,
        backend = %request.backend.kind,
        model = %request.model,
        "chat stream accepted"
    );

    let events = state
        .relay
        .handle(session_id.clone(), request, handle.token());
    let mut response = Sse::new(owned_by(into_sse(events), handle))
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response();
    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }

    state.metrics.observe_request(
        "/chat_stream",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

/// Ties the session registration to the lifetime of the response stream.
fn owned_by<S, G>(stream: S, guard: G) -> impl Stream<Item = Result<Event, Infallible>> + Send
where
    S: Stream<Item = Result<Event, Infallible>> + Send,
    G: Send,
{
    async_stream::stream! {
        let _guard = guard;
        futures_util::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            yield item;
        }
    }
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.sessions.cancel(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no live session {session_id}")))
    }
}

pub async fn chat_once(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Response {
    let started = Instant::now();
    let response = match process_chat_once(&state, payload).await {
        Ok(body) => Json(body).into_response(),
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/chat_once",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn process_chat_once(state: &AppState, payload: ChatPayload) -> Result<OnceResponse, AppError> {
    let settings = state.settings.snapshot().await;
    let request = payload.resolve(&settings);
    let response = state.relay.call_once(&request).await?;

    Ok(OnceResponse {
        backend: request.backend.kind,
        model: request.model,
        response,
    })
}
