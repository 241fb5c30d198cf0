use std::sync::Arc;

use crate::{
    backend::{ModelSource, UpstreamClient},
    catalog::ModelCatalog,
    history::HistoryLog,
    metrics::AppMetrics,
    relay::Relay,
    sessions::SessionRegistry,
    settings::{Settings, SettingsStore},
};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub settings: SettingsStore,
    pub catalog: Arc<ModelCatalog>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new<U>(upstream: Arc<U>, settings: SettingsStore, history: HistoryLog) -> Self
    where
        U: UpstreamClient + ModelSource + 'static,
    {
        let metrics = Arc::new(AppMetrics::new());
        let models: Arc<dyn ModelSource> = upstream.clone();
        let upstream: Arc<dyn UpstreamClient> = upstream;
        Self {
            relay: Relay::new(upstream, metrics.clone(), history),
            settings,
            catalog: Arc::new(ModelCatalog::new(models)),
            sessions: Arc::new(SessionRegistry::default()),
            metrics,
        }
    }

    pub fn new_for_tests<U>(upstream: Arc<U>, settings: Settings) -> Self
    where
        U: UpstreamClient + ModelSource + 'static,
    {
        Self::new(upstream, SettingsStore::fixed(settings), HistoryLog::disabled())
    }
}
