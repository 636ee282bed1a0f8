use std::fmt;
use std::sync::Arc;

use dirsub_core::{
    InMemoryJobStore, InProcJobEventBus, JobStore, OrchestratorConfig, OrchestratorService,
    ProgressFeed,
};

#[derive(Clone)]
pub struct AppState {
    pub service: OrchestratorService,
    pub feed: ProgressFeed,
    pub config: Arc<OrchestratorConfig>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the service and the feed around one store and one event bus.
    pub fn new(store: Arc<dyn JobStore>, config: OrchestratorConfig) -> Self {
        let bus = Arc::new(InProcJobEventBus::new(config.feed.channel_capacity));
        let service = OrchestratorService::new(Arc::clone(&store), bus.clone());
        let feed = ProgressFeed::new(store, bus, config.feed);
        Self {
            service,
            feed,
            config: Arc::new(config),
        }
    }

    pub fn in_memory(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryJobStore::new(&config));
        Self::new(store, config)
    }
}
