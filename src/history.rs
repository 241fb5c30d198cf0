use std::{
    env,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use crate::{
    backend::BackendKind,
    models::{ChatRequest, ChatTurn},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub backend: BackendKind,
    pub model: String,
    pub messages: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl HistoryEntry {
    pub fn new(request: &ChatRequest, response: Option<String>) -> Self {
        Self {
            timestamp: unix_timestamp(),
            backend: request.backend.kind,
            model: request.model.clone(),
            messages: request.turns.clone(),
            response,
        }
    }
}

/// Append-only JSON-lines log of chat exchanges. Failures are logged and
/// never reach the chat path.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: Option<Arc<PathBuf>>,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryLog {
    pub fn from_env() -> Self {
        match env::var("RELAY_HISTORY_PATH") {
            Ok(path) if path.trim().is_empty() => Self::disabled(),
            Ok(path) => Self::file(path),
            Err(_) => Self::file("data/history.jsonl"),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(Arc::new(path.into())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Fire-and-forget append on a background task.
    pub fn record(&self, entry: HistoryEntry) {
        if self.path.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, dropping chat history entry");
            return;
        };
        let log = self.clone();
        runtime.spawn(async move {
            if let Err(error) = log.append(&entry).await {
                warn!(error = %error, "failed to append chat history");
            }
        });
    }

    pub async fn append(&self, entry: &HistoryEntry) -> std::io::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::BackendConfig,
        models::{Role, SamplingParams},
    };

    fn request() -> ChatRequest {
        ChatRequest {
            backend: BackendConfig::resolve(BackendKind::Lmstudio, [""]),
            model: "phi-3".to_owned(),
            turns: vec![ChatTurn::new(Role::User, "hi")],
            sampling: SamplingParams::default(),
        }
    }

    #[tokio::test]
    async fn appends_one_json_line_per_entry() {
        let dir = env::temp_dir().join(format!("local-relay-history-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("history.jsonl");
        let log = HistoryLog::file(&path);

        log.append(&HistoryEntry::new(&request(), None))
            .await
            .expect("first append");
        log.append(&HistoryEntry::new(&request(), Some("hello".to_owned())))
            .await
            .expect("second append");

        let raw = tokio::fs::read_to_string(&path).await.expect("history readable");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let entries = raw
            .lines()
            .map(|line| serde_json::from_str::<HistoryEntry>(line).expect("valid entry"))
            .collect::<Vec<_>>();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].response, None);
        assert_eq!(entries[1].response.as_deref(), Some("hello"));
        assert_eq!(entries[1].backend, BackendKind::Lmstudio);
    }

    #[tokio::test]
    async fn disabled_log_writes_nothing() {
        let log = HistoryLog::disabled();
        log.append(&HistoryEntry::new(&request(), None))
            .await
            .expect("disabled append is a no-op");
    }
}
