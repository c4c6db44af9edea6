//! Version upgrade ladder for experiment documents.
//!
//! Runs on load, before a document is handed to any caller. The ladder is
//! an ordered list of migration steps, each guarded by a precondition on
//! the current version stamp and each idempotent. Steps are applied in a
//! loop until no precondition matches; the terminal state is the stamp
//! this build writes (`FileVersion::current()`).
//!
//! A document stamped with a newer major version than this build supports
//! is rejected without being mutated.

use crate::experiment::{
    CURRENT_PLATFORM, ExperimentDoc, PLATFORM_VERSION, VERSION_MAJOR, VERSION_MINOR,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("newer version detected: document major {found} exceeds supported major {supported}")]
    NewerVersion { found: i32, supported: i32 },

    #[error("upgrade did not converge after {0} steps")]
    DidNotConverge(usize),
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

/// What the ladder did to a document.
#[derive(Debug, Default)]
pub struct UpgradeOutcome {
    /// Names of the steps that ran, in order.
    pub applied: Vec<&'static str>,
}

impl UpgradeOutcome {
    /// True if any step ran; the caller must write the document back so it
    /// is not left stamped with a version newer than what is on disk.
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

struct MigrationStep {
    name: &'static str,
    applies: fn(&ExperimentDoc) -> bool,
    apply: fn(&mut ExperimentDoc),
}

/// The ladder, in fixed order.
const STEPS: &[MigrationStep] = &[
    MigrationStep {
        name: "init-version-stamp",
        applies: |doc| doc.file_version.major == 0,
        apply: |doc| {
            doc.file_version.major = 1;
            doc.file_version.minor = 0;
        },
    },
    MigrationStep {
        name: "backfill-metadata",
        applies: |doc| doc.file_version.major == 1 && doc.file_version.minor == 0,
        apply: |doc| {
            if doc.title.is_empty() {
                doc.title = "Untitled Experiment".into();
            }
            doc.file_version.minor = 1;
        },
    },
    MigrationStep {
        name: "backfill-trial-titles",
        applies: |doc| doc.file_version.major == 1 && doc.file_version.minor == 1,
        apply: |doc| {
            for (pos, trial) in doc.trials.iter_mut().enumerate() {
                if trial.title.is_empty() {
                    trial.title = format!("Recording {}", pos + 1);
                }
            }
            doc.file_version.minor = 2;
        },
    },
    MigrationStep {
        name: "normalize-platform",
        applies: |doc| doc.file_version.platform != CURRENT_PLATFORM,
        apply: |doc| {
            // Foreign platform versions are meaningless here; reset so the
            // platform steps below re-derive everything.
            doc.file_version.platform = CURRENT_PLATFORM;
            doc.file_version.platform_version = 0;
        },
    },
    MigrationStep {
        name: "derive-trial-indices",
        applies: |doc| {
            doc.file_version.platform == CURRENT_PLATFORM
                && doc.file_version.platform_version == 0
        },
        apply: |doc| {
            // Trial ordering indices were not always persisted; derive
            // missing ones from document position.
            for pos in 0..doc.trials.len() {
                if doc.trials[pos].index < 0 {
                    doc.trials[pos].index = pos as i64;
                }
            }
            doc.file_version.platform_version = 1;
        },
    },
    MigrationStep {
        name: "renumber-trial-indices",
        applies: |doc| {
            doc.file_version.platform == CURRENT_PLATFORM
                && doc.file_version.platform_version == 1
        },
        apply: |doc| {
            // Collapse duplicate indices (possible after merging documents
            // from two devices) into a dense 0..n ordering.
            doc.trials.sort_by_key(|t| t.index);
            for (pos, trial) in doc.trials.iter_mut().enumerate() {
                trial.index = pos as i64;
            }
            doc.file_version.platform_version = 2;
        },
    },
];

/// Upgrade a document to the version this build writes.
///
/// Returns the steps applied; `UpgradeOutcome::changed()` tells the caller
/// whether a write-back is required. The document is untouched on error.
pub fn upgrade_to_current(doc: &mut ExperimentDoc) -> Result<UpgradeOutcome> {
    if doc.file_version.major > VERSION_MAJOR {
        return Err(UpgradeError::NewerVersion {
            found: doc.file_version.major,
            supported: VERSION_MAJOR,
        });
    }

    let mut outcome = UpgradeOutcome::default();
    let max_rounds = STEPS.len() * 2;

    for _ in 0..=max_rounds {
        let Some(step) = STEPS.iter().find(|s| (s.applies)(doc)) else {
            if outcome.changed() {
                debug!(
                    experiment = %doc.experiment_id,
                    steps = ?outcome.applied,
                    "upgraded document"
                );
            }
            return Ok(outcome);
        };
        (step.apply)(doc);
        outcome.applied.push(step.name);
    }

    Err(UpgradeError::DidNotConverge(outcome.applied.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{FileVersion, Platform, Trial};

    fn legacy_doc() -> ExperimentDoc {
        let mut doc = ExperimentDoc::shell("e1");
        doc.file_version = FileVersion::default(); // zero stamp
        doc
    }

    #[test]
    fn test_newer_major_rejected_without_mutation() {
        let mut doc = ExperimentDoc::shell("e1");
        doc.file_version.major = VERSION_MAJOR + 1;
        doc.title = "Future".into();
        let before = doc.clone();

        let err = upgrade_to_current(&mut doc).unwrap_err();
        assert!(matches!(err, UpgradeError::NewerVersion { .. }));
        assert_eq!(doc, before);
    }

    #[test]
    fn test_zero_stamp_walks_full_ladder() {
        let mut doc = legacy_doc();
        doc.trials.push(Trial {
            trial_id: "t1".into(),
            title: String::new(),
            index: -1,
            sensor_data_ids: vec![],
        });

        let outcome = upgrade_to_current(&mut doc).unwrap();
        assert!(outcome.changed());

        // Terminal state: the stamp this build writes.
        assert_eq!(doc.file_version.major, VERSION_MAJOR);
        assert_eq!(doc.file_version.minor, VERSION_MINOR);
        assert_eq!(doc.file_version.platform_version, PLATFORM_VERSION);
        assert_eq!(doc.file_version.platform, CURRENT_PLATFORM);

        // Backfills ran.
        assert_eq!(doc.title, "Untitled Experiment");
        assert_eq!(doc.trials[0].title, "Recording 1");
        assert_eq!(doc.trials[0].index, 0);
    }

    #[test]
    fn test_terminal_state_is_noop() {
        let mut doc = legacy_doc();
        upgrade_to_current(&mut doc).unwrap();
        let upgraded = doc.clone();

        let outcome = upgrade_to_current(&mut doc).unwrap();
        assert!(!outcome.changed());
        assert_eq!(doc, upgraded);
    }

    #[test]
    fn test_derives_missing_trial_indices() {
        let mut doc = legacy_doc();
        doc.trials = vec![
            Trial::new("a", -1),
            Trial::new("b", -1),
            Trial::new("c", -1),
        ];

        upgrade_to_current(&mut doc).unwrap();

        let indices: Vec<i64> = doc.trials.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_renumbers_duplicate_indices() {
        let mut doc = legacy_doc();
        doc.file_version = FileVersion {
            major: 1,
            minor: 2,
            platform_version: 1,
            platform: CURRENT_PLATFORM,
        };
        // Duplicates can appear after merging trials from two devices.
        doc.trials = vec![Trial::new("a", 1), Trial::new("b", 1), Trial::new("c", 0)];

        upgrade_to_current(&mut doc).unwrap();

        let order: Vec<(&str, i64)> = doc
            .trials
            .iter()
            .map(|t| (t.trial_id.as_str(), t.index))
            .collect();
        assert_eq!(order, vec![("c", 0), ("a", 1), ("b", 2)]);
    }

    #[test]
    fn test_foreign_platform_normalized_and_rederived() {
        let mut doc = legacy_doc();
        doc.file_version = FileVersion {
            major: 1,
            minor: 2,
            platform_version: 2,
            platform: Platform::Android,
        };
        doc.trials = vec![Trial::new("a", -1)];

        let outcome = upgrade_to_current(&mut doc).unwrap();

        assert!(outcome.applied.contains(&"normalize-platform"));
        assert_eq!(doc.file_version.platform, CURRENT_PLATFORM);
        assert_eq!(doc.file_version.platform_version, PLATFORM_VERSION);
        // Index re-derivation ran after normalization.
        assert_eq!(doc.trials[0].index, 0);
    }
}
