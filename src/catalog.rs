use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::{BackendConfig, BackendKind, ModelSource, UpstreamError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub base_url: String,
    pub models: Vec<String>,
    pub fetched_at: u64,
}

/// Per-backend model lists for the selection UI. Entries are replaced whole,
/// so a reader always sees either the previous list or the new one.
pub struct ModelCatalog {
    source: Arc<dyn ModelSource>,
    entries: RwLock<HashMap<BackendKind, Arc<CatalogEntry>>>,
}

impl ModelCatalog {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn cached(&self, kind: BackendKind) -> Option<Arc<CatalogEntry>> {
        self.entries.read().await.get(&kind).cloned()
    }

    /// Serves the cached entry unless `refresh` is set or the backend moved
    /// to a different base URL.
    pub async fn models(
        &self,
        backend: &BackendConfig,
        refresh: bool,
    ) -> Result<Arc<CatalogEntry>, UpstreamError> {
        if !refresh {
            if let Some(entry) = self
                .cached(backend.kind)
                .await
                .filter(|entry| entry.base_url == backend.base_url)
            {
                return Ok(entry);
            }
        }
        self.refresh(backend).await
    }

    pub async fn refresh(&self, backend: &BackendConfig) -> Result<Arc<CatalogEntry>, UpstreamError> {
        let models = match self.source.list_models(backend).await {
            Ok(models) => models,
            Err(error) => {
                warn!(backend = %backend.kind, base_url = %backend.base_url, error = %error, "model listing failed");
                return Err(error);
            }
        };

        let entry = Arc::new(CatalogEntry {
            base_url: backend.base_url.clone(),
            models,
            fetched_at: unix_timestamp(),
        });
        self.entries
            .write()
            .await
            .insert(backend.kind, entry.clone());
        debug!(backend = %backend.kind, count = entry.models.len(), "model catalog refreshed");
        Ok(entry)
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
