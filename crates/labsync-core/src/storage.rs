//! On-disk layout for a synced account.
//!
//! ```text
//! library.json                                the experiment library index
//! sync_status.json                            per-experiment sync bookkeeping
//! experiments/<id>/experiment.json            experiment metadata document
//! experiments/<id>/assets/<name>              image and sensor-data files
//! ```

/// The experiment library index document.
pub const LIBRARY_FILE: &str = "library.json";

/// Per-experiment sync status document.
pub const SYNC_STATUS_FILE: &str = "sync_status.json";

/// Directory holding one subdirectory per experiment.
pub const EXPERIMENTS_DIR: &str = "experiments";

/// Directory for an experiment's files.
pub fn experiment_dir(experiment_id: &str) -> String {
    format!("{}/{}", EXPERIMENTS_DIR, experiment_id)
}

/// Path to an experiment's metadata document.
pub fn experiment_file(experiment_id: &str) -> String {
    format!("{}/{}/experiment.json", EXPERIMENTS_DIR, experiment_id)
}

/// Path to a single asset file.
pub fn asset_file(experiment_id: &str, name: &str) -> String {
    format!("{}/{}/assets/{}", EXPERIMENTS_DIR, experiment_id, name)
}

/// Current time in milliseconds since epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
