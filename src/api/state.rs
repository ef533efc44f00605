use std::sync::Arc;

use crate::history::{History, HistoryError, HistoryStore};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HistoryStore>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(store: Arc<dyn HistoryStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    /// Load history off the async runtime.
    pub async fn load_history(&self) -> Result<History, HistoryError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.load()).await?
    }
}
