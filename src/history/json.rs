//! Flat-file history: `pipeline_history.json` and `release_history.json`.
//!
//! Each file holds one JSON array. Writes go to a sibling temp file that is
//! renamed over the original, so readers see a whole file or the previous
//! one, never a partial write. A mutex serializes writers in this process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{trim_front, History, HistoryError, HistoryStore, RELEASE_HISTORY_CAP, RUN_HISTORY_CAP};
use crate::pipeline::{ReleaseRecord, RunRecord};

pub const RUNS_FILE: &str = "pipeline_history.json";
pub const RELEASES_FILE: &str = "release_history.json";

pub struct JsonHistory {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn runs_path(&self) -> PathBuf {
        self.dir.join(RUNS_FILE)
    }

    pub fn releases_path(&self) -> PathBuf {
        self.dir.join(RELEASES_FILE)
    }

    fn append<T>(&self, path: &Path, record: &T, cap: usize) -> Result<(), HistoryError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let _guard = self.write_lock.lock().map_err(|_| HistoryError::Poisoned)?;

        let mut seq: Vec<T> = read_seq(path)?;
        seq.push(record.clone());
        trim_front(&mut seq, cap);
        write_seq(path, &seq)?;

        debug!(path = %path.display(), len = seq.len(), "history appended");
        Ok(())
    }
}

impl HistoryStore for JsonHistory {
    fn load(&self) -> Result<History, HistoryError> {
        Ok(History {
            runs: read_seq(&self.runs_path())?,
            releases: read_seq(&self.releases_path())?,
        })
    }

    fn append_run(&self, record: &RunRecord) -> Result<(), HistoryError> {
        self.append(&self.runs_path(), record, RUN_HISTORY_CAP)
    }

    fn append_release(&self, record: &ReleaseRecord) -> Result<(), HistoryError> {
        self.append(&self.releases_path(), record, RELEASE_HISTORY_CAP)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> HistoryError {
    HistoryError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_seq<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, HistoryError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|source| HistoryError::Corrupt {
        location: path.display().to_string(),
        source,
    })
}

fn write_seq<T: Serialize>(path: &Path, seq: &[T]) -> Result<(), HistoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let body = serde_json::to_string_pretty(seq).map_err(HistoryError::Serialize)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}
