//! ExperimentLibrary: the authoritative list of experiments this device
//! knows about.
//!
//! The library is itself a document synced to the remote store, so records
//! are never physically removed once created: deletion is a tombstone flag
//! that other devices observe through the record-level merge.

use crate::fs::{FileSystem, FsError};
use crate::storage::{LIBRARY_FILE, now_ms};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// One known experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_id: String,
    /// Identifier of the remote package holding this experiment.
    /// Assigned lazily on first upload; once assigned, never reassigned.
    #[serde(default)]
    pub remote_file_id: Option<String>,
    #[serde(default)]
    pub last_opened_ms: u64,
    #[serde(default)]
    pub last_modified_ms: u64,
    /// Tombstone. Records are never removed, only flagged.
    #[serde(default)]
    pub deleted: bool,
    /// This device's archival view of the experiment.
    #[serde(default)]
    pub archived: bool,
}

impl ExperimentRecord {
    fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            remote_file_id: None,
            last_opened_ms: 0,
            last_modified_ms: 0,
            deleted: false,
            archived: false,
        }
    }
}

/// The library index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentLibrary {
    /// Remote container holding all experiment packages.
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Remote file id of the library document itself.
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    records: Vec<ExperimentRecord>,
}

impl ExperimentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the library from disk, or an empty one if none exists.
    pub async fn load<F: FileSystem>(fs: &F) -> Result<Self> {
        if !fs.exists(LIBRARY_FILE).await? {
            return Ok(Self::new());
        }
        let bytes = fs.read(LIBRARY_FILE).await?;
        Self::from_bytes(&bytes)
    }

    /// Save the library to disk.
    pub async fn save<F: FileSystem>(&self, fs: &F) -> Result<()> {
        fs.write(LIBRARY_FILE, &self.to_bytes()?).await?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| LibraryError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| LibraryError::Serialization(e.to_string()))
    }

    pub fn get(&self, experiment_id: &str) -> Option<&ExperimentRecord> {
        self.records
            .iter()
            .find(|r| r.experiment_id == experiment_id)
    }

    fn get_mut(&mut self, experiment_id: &str) -> Option<&mut ExperimentRecord> {
        self.records
            .iter_mut()
            .find(|r| r.experiment_id == experiment_id)
    }

    /// All known experiment ids, including tombstoned ones.
    pub fn known_experiments(&self) -> Vec<String> {
        self.records.iter().map(|r| r.experiment_id.clone()).collect()
    }

    /// Create a record if absent. No-op if the experiment is already known.
    pub fn add_experiment(&mut self, experiment_id: &str) {
        if self.get(experiment_id).is_none() {
            self.records.push(ExperimentRecord::new(experiment_id));
        }
    }

    // Mutators on an unknown id are no-ops: records only come into
    // existence through add_experiment or the library merge.

    pub fn set_archived(&mut self, experiment_id: &str, archived: bool) {
        if let Some(record) = self.get_mut(experiment_id) {
            record.archived = archived;
            record.last_modified_ms = now_ms();
        }
    }

    pub fn set_deleted(&mut self, experiment_id: &str, deleted: bool) {
        if let Some(record) = self.get_mut(experiment_id) {
            record.deleted = deleted;
            record.last_modified_ms = now_ms();
        }
    }

    pub fn set_opened(&mut self, experiment_id: &str, time_ms: Option<u64>) {
        if let Some(record) = self.get_mut(experiment_id) {
            record.last_opened_ms = time_ms.unwrap_or_else(now_ms);
        }
    }

    pub fn set_modified(&mut self, experiment_id: &str, time_ms: Option<u64>) {
        if let Some(record) = self.get_mut(experiment_id) {
            record.last_modified_ms = time_ms.unwrap_or_else(now_ms);
        }
    }

    pub fn file_id_of(&self, experiment_id: &str) -> Option<String> {
        self.get(experiment_id)
            .and_then(|r| r.remote_file_id.clone())
    }

    /// Assign the remote file id for an experiment.
    ///
    /// A file id, once assigned, is never reassigned to a different remote
    /// object; a conflicting assignment is ignored and logged.
    pub fn set_file_id(&mut self, experiment_id: &str, file_id: impl Into<String>) {
        let file_id = file_id.into();
        if let Some(record) = self.get_mut(experiment_id) {
            match &record.remote_file_id {
                None => record.remote_file_id = Some(file_id),
                Some(existing) if *existing == file_id => {}
                Some(existing) => {
                    warn!(
                        experiment = %experiment_id,
                        existing = %existing,
                        rejected = %file_id,
                        "refusing to reassign remote file id"
                    );
                }
            }
        }
    }

    /// Merge a remote copy of the library into this one.
    ///
    /// Record-level merge: a record absent locally is adopted; for records
    /// present on both sides the one with the later `last_modified_ms`
    /// wins. Two exceptions to latest-wins, both one-way:
    /// - `deleted` tombstones stick once set by either side
    /// - a locally assigned `remote_file_id` is never replaced
    pub fn merge_from(&mut self, remote: &ExperimentLibrary) {
        if self.folder_id.is_none() {
            self.folder_id = remote.folder_id.clone();
        }
        if self.file_id.is_none() {
            self.file_id = remote.file_id.clone();
        }

        for remote_record in &remote.records {
            let position = self
                .records
                .iter()
                .position(|r| r.experiment_id == remote_record.experiment_id);
            match position {
                None => self.records.push(remote_record.clone()),
                Some(position) => {
                    let local_record = &mut self.records[position];
                    let deleted = local_record.deleted || remote_record.deleted;
                    let file_id = local_record
                        .remote_file_id
                        .clone()
                        .or_else(|| remote_record.remote_file_id.clone());

                    if remote_record.last_modified_ms > local_record.last_modified_ms {
                        *local_record = remote_record.clone();
                    }
                    local_record.deleted = deleted;
                    local_record.remote_file_id = file_id;
                }
            }
        }
    }
}
