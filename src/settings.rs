use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    backend::BackendKind,
    models::{SamplingParams, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_P},
};

/// Persisted user settings. The relay only ever reads a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendKind,
    pub ollama_base_url: String,
    pub lmstudio_base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Ollama,
            ollama_base_url: BackendKind::Ollama.descriptor().default_base_url.to_owned(),
            lmstudio_base_url: BackendKind::Lmstudio
                .descriptor()
                .default_base_url
                .to_owned(),
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: i64::from(DEFAULT_MAX_TOKENS),
        }
    }
}

impl Settings {
    pub fn base_url_for(&self, kind: BackendKind) -> &str {
        match kind {
            BackendKind::Ollama => &self.ollama_base_url,
            BackendKind::Lmstudio => &self.lmstudio_base_url,
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::resolve(
            Some(self.temperature),
            Some(self.top_p),
            Some(self.max_tokens),
            SamplingParams::default(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    source: SettingsSource,
}

#[derive(Debug, Clone)]
enum SettingsSource {
    File(PathBuf),
    Fixed(Settings),
}

impl SettingsStore {
    pub fn from_env() -> Self {
        let path = env::var("RELAY_SETTINGS_PATH").unwrap_or_else(|_| "settings.json".to_owned());
        Self::file(path)
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: SettingsSource::File(path.into()),
        }
    }

    pub fn fixed(settings: Settings) -> Self {
        Self {
            source: SettingsSource::Fixed(settings),
        }
    }

    /// Re-read on every call so edits made by the settings UI apply to the
    /// next request without a restart.
    pub async fn snapshot(&self) -> Settings {
        match &self.source {
            SettingsSource::Fixed(settings) => settings.clone(),
            SettingsSource::File(path) => load_file(path).await,
        }
    }
}

async fn load_file(path: &Path) -> Settings {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "failed to read settings file, using defaults");
            return Settings::default();
        }
    };

    match serde_json::from_str::<Settings>(&raw) {
        Ok(settings) => settings,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "invalid settings file, using defaults");
            Settings::default()
        }
    }
}
