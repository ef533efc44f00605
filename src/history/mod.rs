//! Bounded run/release history.
//!
//! Two independent insertion-ordered sequences, each capped and trimmed
//! oldest-first on every append. The orchestrator is the only writer; the
//! dashboard, API and summary queries only read.

pub mod json;
pub mod memory;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{ReleaseRecord, RunRecord};

pub use self::json::JsonHistory;
pub use self::memory::MemoryHistory;
pub use self::sqlite::SqliteHistory;

/// Maximum number of run records kept.
pub const RUN_HISTORY_CAP: usize = 50;
/// Maximum number of release records kept.
pub const RELEASE_HISTORY_CAP: usize = 30;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("history connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("corrupt history entry in {location}: {source}")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("history serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("history store is poisoned")]
    Poisoned,

    #[error("history task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A snapshot of both sequences, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub runs: Vec<RunRecord>,
    pub releases: Vec<ReleaseRecord>,
}

/// Persistence contract for history.
///
/// Appends must persist and trim as one critical section: a concurrent
/// `load` sees either the state before the append or the fully trimmed
/// state after it.
pub trait HistoryStore: Send + Sync {
    /// Current state; empty sequences when nothing was ever written.
    fn load(&self) -> Result<History, HistoryError>;

    fn append_run(&self, record: &RunRecord) -> Result<(), HistoryError>;

    fn append_release(&self, record: &ReleaseRecord) -> Result<(), HistoryError>;
}

/// Evict from the front until `seq.len() <= cap`.
pub(crate) fn trim_front<T>(seq: &mut Vec<T>, cap: usize) {
    if seq.len() > cap {
        let excess = seq.len() - cap;
        seq.drain(..excess);
    }
}
