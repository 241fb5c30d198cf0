pub mod backend;
pub mod catalog;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod history;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod sessions;
pub mod settings;
pub mod state;

use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use backend::{http::HttpUpstream, BackendKind};
use history::HistoryLog;
use settings::SettingsStore;
use tracing::info;

pub fn build_state() -> Result<state::AppState, std::io::Error> {
    let upstream = HttpUpstream::from_env().map_err(std::io::Error::other)?;
    let settings = SettingsStore::from_env();
    let history = HistoryLog::from_env();

    let defaults = BackendKind::ALL
        .iter()
        .map(|kind| format!("{kind}={}", kind.descriptor().default_base_url))
        .collect::<Vec<_>>()
        .join(",");
    info!(backends = %defaults, "relay configured");
    Ok(state::AppState::new(Arc::new(upstream), settings, history))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/settings", get(handlers::settings))
        .route("/models", get(handlers::list_models))
        .route("/chat_stream", post(handlers::chat_stream))
        .route("/chat_stream/:session_id/cancel", post(handlers::cancel_session))
        .route("/chat_once", post(handlers::chat_once))
        .with_state(state)
}

pub fn bind_addr() -> Result<SocketAddr, std::io::Error> {
    let host = env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
    let port = env::var("RELAY_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8000);
    format!("{host}:{port}")
        .parse()
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error))
}
