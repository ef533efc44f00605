//! In-process history, used for tests and throwaway runs.

use std::sync::RwLock;

use super::{trim_front, History, HistoryError, HistoryStore, RELEASE_HISTORY_CAP, RUN_HISTORY_CAP};
use crate::pipeline::{ReleaseRecord, RunRecord};

#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: RwLock<History>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, trimmed to the caps.
    pub fn with_history(mut history: History) -> Self {
        trim_front(&mut history.runs, RUN_HISTORY_CAP);
        trim_front(&mut history.releases, RELEASE_HISTORY_CAP);
        Self {
            inner: RwLock::new(history),
        }
    }
}

impl HistoryStore for MemoryHistory {
    fn load(&self) -> Result<History, HistoryError> {
        let guard = self.inner.read().map_err(|_| HistoryError::Poisoned)?;
        Ok(guard.clone())
    }

    fn append_run(&self, record: &RunRecord) -> Result<(), HistoryError> {
        let mut guard = self.inner.write().map_err(|_| HistoryError::Poisoned)?;
        guard.runs.push(record.clone());
        trim_front(&mut guard.runs, RUN_HISTORY_CAP);
        Ok(())
    }

    fn append_release(&self, record: &ReleaseRecord) -> Result<(), HistoryError> {
        let mut guard = self.inner.write().map_err(|_| HistoryError::Poisoned)?;
        guard.releases.push(record.clone());
        trim_front(&mut guard.releases, RELEASE_HISTORY_CAP);
        Ok(())
    }
}
