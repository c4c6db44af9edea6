//! Per-experiment sync bookkeeping.
//!
//! Tracks, for every known experiment, whether it has local edits not yet
//! pushed (`dirty`), the remote revision last reconciled, the archival
//! state last observed on the server, and whether all assets have been
//! downloaded. The orchestrator reads these to decide whether a merge is
//! required and updates them after every successful push or pull.
//!
//! Accessors are total: getters return the zero value for unknown ids and
//! setters create the record on first use, so callers never have to order
//! `add_experiment` calls carefully.

use crate::fs::{FileSystem, FsError};
use crate::storage::SYNC_STATUS_FILE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StatusError>;

/// Sync state for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSyncStatus {
    pub experiment_id: String,
    /// Local changes not yet reflected in the remote copy.
    #[serde(default)]
    pub dirty: bool,
    /// Remote revision last reconciled; 0 = never synced.
    #[serde(default)]
    pub last_synced_version: i64,
    /// Archival state last observed from the remote side.
    #[serde(default)]
    pub server_archived: bool,
    /// All asset files present locally.
    #[serde(default)]
    pub downloaded: bool,
}

impl LocalSyncStatus {
    fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            dirty: false,
            last_synced_version: 0,
            server_archived: false,
            downloaded: false,
        }
    }
}

/// All per-experiment statuses plus the last reconciled library revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatusTracker {
    /// Revision of the remote library document last reconciled.
    #[serde(default)]
    library_revision: i64,
    #[serde(default)]
    statuses: Vec<LocalSyncStatus>,
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load<F: FileSystem>(fs: &F) -> Result<Self> {
        if !fs.exists(SYNC_STATUS_FILE).await? {
            return Ok(Self::new());
        }
        let bytes = fs.read(SYNC_STATUS_FILE).await?;
        serde_json::from_slice(&bytes).map_err(|e| StatusError::Serialization(e.to_string()))
    }

    pub async fn save<F: FileSystem>(&self, fs: &F) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| StatusError::Serialization(e.to_string()))?;
        fs.write(SYNC_STATUS_FILE, &bytes).await?;
        Ok(())
    }

    pub fn library_revision(&self) -> i64 {
        self.library_revision
    }

    pub fn set_library_revision(&mut self, revision: i64) {
        self.library_revision = revision;
    }

    fn get(&self, experiment_id: &str) -> Option<&LocalSyncStatus> {
        self.statuses
            .iter()
            .find(|s| s.experiment_id == experiment_id)
    }

    fn get_or_create(&mut self, experiment_id: &str) -> &mut LocalSyncStatus {
        let position = self
            .statuses
            .iter()
            .position(|s| s.experiment_id == experiment_id)
            .unwrap_or_else(|| {
                self.statuses.push(LocalSyncStatus::new(experiment_id));
                self.statuses.len() - 1
            });
        &mut self.statuses[position]
    }

    /// Create a zero-value record if absent.
    pub fn add_experiment(&mut self, experiment_id: &str) {
        self.get_or_create(experiment_id);
    }

    pub fn is_dirty(&self, experiment_id: &str) -> bool {
        self.get(experiment_id).is_some_and(|s| s.dirty)
    }

    pub fn set_dirty(&mut self, experiment_id: &str, dirty: bool) {
        self.get_or_create(experiment_id).dirty = dirty;
    }

    pub fn last_synced_version(&self, experiment_id: &str) -> i64 {
        self.get(experiment_id)
            .map(|s| s.last_synced_version)
            .unwrap_or(0)
    }

    pub fn set_last_synced_version(&mut self, experiment_id: &str, version: i64) {
        self.get_or_create(experiment_id).last_synced_version = version;
    }

    pub fn server_archived(&self, experiment_id: &str) -> bool {
        self.get(experiment_id).is_some_and(|s| s.server_archived)
    }

    pub fn set_server_archived(&mut self, experiment_id: &str, archived: bool) {
        self.get_or_create(experiment_id).server_archived = archived;
    }

    pub fn is_downloaded(&self, experiment_id: &str) -> bool {
        self.get(experiment_id).is_some_and(|s| s.downloaded)
    }

    pub fn set_downloaded(&mut self, experiment_id: &str, downloaded: bool) {
        self.get_or_create(experiment_id).downloaded = downloaded;
    }
}
