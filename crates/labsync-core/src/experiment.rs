//! Experiment metadata documents.
//!
//! Each experiment is persisted as a schema-versioned JSON document:
//! - `file_version`: version stamp driving the upgrade ladder (see `upgrade`)
//! - `image_ids`: cover/photo asset names stored under the experiment's assets dir
//! - `trials`: recorded trials, each with its own sensor-data asset names
//!
//! The version stamp governs compatibility: a document whose major version
//! exceeds what this build understands must never be overwritten.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Major version this build reads and writes.
pub const VERSION_MAJOR: i32 = 1;
/// Minor version this build writes.
pub const VERSION_MINOR: i32 = 2;
/// Platform-specific version this build writes.
pub const PLATFORM_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Platform a document was last written by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    #[default]
    Desktop,
}

/// Platform this build stamps into documents it writes.
pub const CURRENT_PLATFORM: Platform = Platform::Desktop;

/// Version stamp persisted in every experiment document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub major: i32,
    pub minor: i32,
    pub platform_version: i32,
    pub platform: Platform,
}

impl Default for FileVersion {
    /// The zero stamp, used for legacy documents persisted before
    /// version stamps existed.
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            platform_version: 0,
            platform: CURRENT_PLATFORM,
        }
    }
}

impl FileVersion {
    /// The stamp this build writes.
    pub fn current() -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            platform_version: PLATFORM_VERSION,
            platform: CURRENT_PLATFORM,
        }
    }

    /// Ordering key for "prefer the higher version stamp" tie-breaks.
    fn rank(&self) -> (i32, i32, i32) {
        (self.major, self.minor, self.platform_version)
    }

    /// Return the higher of two stamps.
    pub fn max_stamp(a: FileVersion, b: FileVersion) -> FileVersion {
        if a.rank() >= b.rank() { a } else { b }
    }
}

/// A recorded trial within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: String,
    #[serde(default)]
    pub title: String,
    /// Ordering index. Old documents did not persist this; -1 means
    /// "not yet derived" and is backfilled by the upgrade ladder.
    #[serde(default = "unset_index")]
    pub index: i64,
    /// Names of sensor-data asset files belonging to this trial.
    #[serde(default)]
    pub sensor_data_ids: Vec<String>,
}

fn unset_index() -> i64 {
    -1
}

impl Trial {
    pub fn new(trial_id: impl Into<String>, index: i64) -> Self {
        Self {
            trial_id: trial_id.into(),
            title: String::new(),
            index,
            sensor_data_ids: Vec::new(),
        }
    }
}

/// The per-experiment metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDoc {
    #[serde(default)]
    pub file_version: FileVersion,
    pub experiment_id: String,
    #[serde(default)]
    pub title: String,
    /// Last time the experiment was used, in milliseconds since epoch.
    #[serde(default)]
    pub last_used_ms: u64,
    #[serde(default)]
    pub archived: bool,
    /// Names of image asset files stored under the experiment's assets dir.
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default)]
    pub trials: Vec<Trial>,
}

impl ExperimentDoc {
    /// Create a new experiment stamped with the current version.
    pub fn new(title: impl Into<String>, now_ms: u64) -> Self {
        Self {
            file_version: FileVersion::current(),
            experiment_id: Uuid::new_v4().to_string(),
            title: title.into(),
            last_used_ms: now_ms,
            archived: false,
            image_ids: Vec::new(),
            trials: Vec::new(),
        }
    }

    /// Create an empty shell for an experiment discovered remotely.
    /// The remote document is merged into it before first use.
    pub fn shell(experiment_id: impl Into<String>) -> Self {
        Self {
            file_version: FileVersion::current(),
            experiment_id: experiment_id.into(),
            title: String::new(),
            last_used_ms: 0,
            archived: false,
            image_ids: Vec::new(),
            trials: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| DocumentError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DocumentError::Serialization(e.to_string()))
    }

    /// All sensor-data asset names across trials.
    pub fn sensor_data_ids(&self) -> Vec<String> {
        self.trials
            .iter()
            .flat_map(|t| t.sensor_data_ids.iter().cloned())
            .collect()
    }
}

/// Merges two experiment documents during reconciliation.
///
/// The exact field-level conflict policy lives behind this trait; the
/// orchestrator only requires that the result contains the union of both
/// sides' asset references so nothing is silently dropped.
pub trait ExperimentMerger: Send + Sync {
    fn merge(&self, local: &ExperimentDoc, remote: &ExperimentDoc) -> ExperimentDoc;
}

/// Default merge policy: remote structural content wins, the higher
/// version stamp of the two is kept, and asset references are unioned.
pub struct LastWriterMerger;

impl ExperimentMerger for LastWriterMerger {
    fn merge(&self, local: &ExperimentDoc, remote: &ExperimentDoc) -> ExperimentDoc {
        let mut merged = remote.clone();
        merged.file_version = FileVersion::max_stamp(local.file_version, remote.file_version);
        merged.last_used_ms = local.last_used_ms.max(remote.last_used_ms);

        // Union image references: remote order first, local-only appended.
        for image in &local.image_ids {
            if !merged.image_ids.contains(image) {
                merged.image_ids.push(image.clone());
            }
        }

        // Union trials by id; within a shared trial, union sensor data refs.
        for local_trial in &local.trials {
            let position = merged
                .trials
                .iter()
                .position(|t| t.trial_id == local_trial.trial_id);
            match position {
                Some(position) => {
                    let remote_trial = &mut merged.trials[position];
                    for id in &local_trial.sensor_data_ids {
                        if !remote_trial.sensor_data_ids.contains(id) {
                            remote_trial.sensor_data_ids.push(id.clone());
                        }
                    }
                }
                None => merged.trials.push(local_trial.clone()),
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_document_defaults_to_zero_stamp() {
        // A document persisted before version stamps existed.
        let json = r#"{"experiment_id": "e1", "title": "Old"}"#;
        let doc = ExperimentDoc::from_bytes(json.as_bytes()).unwrap();

        assert_eq!(doc.file_version.major, 0);
        assert_eq!(doc.file_version.minor, 0);
        assert_eq!(doc.file_version.platform_version, 0);
    }

    #[test]
    fn test_trial_index_defaults_to_unset() {
        let json = r#"{"experiment_id": "e1", "trials": [{"trial_id": "t1"}]}"#;
        let doc = ExperimentDoc::from_bytes(json.as_bytes()).unwrap();

        assert_eq!(doc.trials[0].index, -1);
    }

    #[test]
    fn test_roundtrip() {
        let mut doc = ExperimentDoc::new("Plant growth", 1000);
        doc.image_ids.push("cover.jpg".into());
        doc.trials.push(Trial::new("t1", 0));

        let bytes = doc.to_bytes().unwrap();
        let loaded = ExperimentDoc::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_max_stamp_prefers_higher() {
        let older = FileVersion {
            major: 1,
            minor: 1,
            platform_version: 2,
            platform: Platform::Android,
        };
        let newer = FileVersion {
            major: 1,
            minor: 2,
            platform_version: 0,
            platform: Platform::Desktop,
        };

        assert_eq!(FileVersion::max_stamp(older, newer), newer);
        assert_eq!(FileVersion::max_stamp(newer, older), newer);
    }

    #[test]
    fn test_merge_remote_content_wins() {
        let mut local = ExperimentDoc::new("Local title", 1000);
        local.experiment_id = "e1".into();
        let mut remote = local.clone();
        remote.title = "Remote title".into();
        remote.last_used_ms = 2000;

        let merged = LastWriterMerger.merge(&local, &remote);
        assert_eq!(merged.title, "Remote title");
        assert_eq!(merged.last_used_ms, 2000);
    }

    #[test]
    fn test_merge_unions_assets() {
        let mut local = ExperimentDoc::new("E", 0);
        local.experiment_id = "e1".into();
        local.image_ids = vec!["a.jpg".into(), "shared.jpg".into()];
        let mut remote = local.clone();
        remote.image_ids = vec!["shared.jpg".into(), "b.jpg".into()];

        let merged = LastWriterMerger.merge(&local, &remote);
        assert_eq!(merged.image_ids.len(), 3);
        assert!(merged.image_ids.contains(&"a.jpg".to_string()));
        assert!(merged.image_ids.contains(&"b.jpg".to_string()));
        assert!(merged.image_ids.contains(&"shared.jpg".to_string()));
    }

    #[test]
    fn test_merge_unions_trials_and_sensor_data() {
        let mut local = ExperimentDoc::new("E", 0);
        local.experiment_id = "e1".into();
        let mut shared = Trial::new("t1", 0);
        shared.sensor_data_ids = vec!["local.csv".into()];
        local.trials = vec![shared.clone(), Trial::new("local-only", 1)];

        let mut remote = ExperimentDoc::new("E", 0);
        remote.experiment_id = "e1".into();
        let mut remote_shared = Trial::new("t1", 0);
        remote_shared.sensor_data_ids = vec!["remote.csv".into()];
        remote.trials = vec![remote_shared, Trial::new("remote-only", 1)];

        let merged = LastWriterMerger.merge(&local, &remote);
        assert_eq!(merged.trials.len(), 3);

        let t1 = merged.trials.iter().find(|t| t.trial_id == "t1").unwrap();
        assert!(t1.sensor_data_ids.contains(&"local.csv".to_string()));
        assert!(t1.sensor_data_ids.contains(&"remote.csv".to_string()));
    }
}
