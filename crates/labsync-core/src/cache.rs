//! Write-coalescing cache for the active experiment document.
//!
//! At most one experiment is held in memory at a time. Edits go through
//! `update_experiment`, which marks the cached copy pending and arms a
//! flush deadline; repeated edits within the debounce window coalesce into
//! one disk write. Switching experiments flushes the previous one before
//! the next is loaded, so a pending write can never be lost to a switch.
//!
//! Deadlines are evaluated against caller-supplied clocks (`tick(now_ms)`)
//! rather than internal timers, which keeps the debounce behavior
//! deterministic under test. The embedding runtime is expected to call
//! `tick` periodically.

use crate::experiment::{DocumentError, ExperimentDoc};
use crate::fs::{FileSystem, FsError};
use crate::storage::{experiment_dir, experiment_file};
use crate::upgrade::{UpgradeError, upgrade_to_current};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long after the first un-flushed edit the write happens.
    pub debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

struct ActiveExperiment {
    doc: ExperimentDoc,
    /// The cached copy differs from disk.
    needs_write: bool,
    /// Deadline for the pending write. Armed by the first edit after a
    /// flush and not re-armed by later edits, so a steady stream of edits
    /// still flushes once per window.
    flush_due_at: Option<u64>,
}

/// Single-slot experiment cache with debounced write-back.
pub struct ExperimentCache<F: FileSystem> {
    fs: F,
    config: CacheConfig,
    active: Option<ActiveExperiment>,
}

impl<F: FileSystem> ExperimentCache<F> {
    pub fn new(fs: F) -> Self {
        Self::with_config(fs, CacheConfig::default())
    }

    pub fn with_config(fs: F, config: CacheConfig) -> Self {
        Self {
            fs,
            config,
            active: None,
        }
    }

    /// Id of the experiment currently held in the cache, if any.
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.doc.experiment_id.as_str())
    }

    /// Get an experiment document, making it the active one.
    ///
    /// If a different experiment is active its pending write is flushed
    /// first. The loaded document is run through the upgrade ladder; if
    /// the ladder changed it, the upgraded form is written back so disk
    /// never lags the stamp the caller sees. A document from a newer
    /// major version fails here without being touched.
    pub async fn get_experiment(&mut self, experiment_id: &str) -> Result<ExperimentDoc> {
        if let Some(active) = &self.active {
            if active.doc.experiment_id == experiment_id {
                return Ok(active.doc.clone());
            }
        }
        self.activate(experiment_id).await
    }

    async fn activate(&mut self, experiment_id: &str) -> Result<ExperimentDoc> {
        self.save_immediately().await?;
        self.active = None;

        let bytes = self.fs.read(&experiment_file(experiment_id)).await?;
        let mut doc = ExperimentDoc::from_bytes(&bytes)?;

        let outcome = upgrade_to_current(&mut doc)?;
        if outcome.changed() {
            self.fs
                .write(&experiment_file(experiment_id), &doc.to_bytes()?)
                .await?;
        }

        self.active = Some(ActiveExperiment {
            doc: doc.clone(),
            needs_write: false,
            flush_due_at: None,
        });
        Ok(doc)
    }

    /// Stage an edited document for write-back.
    ///
    /// The write is deferred until the debounce deadline passes or the
    /// cache is flushed for another reason.
    pub async fn update_experiment(&mut self, doc: ExperimentDoc, now_ms: u64) -> Result<()> {
        match &mut self.active {
            Some(active) if active.doc.experiment_id == doc.experiment_id => {
                active.doc = doc;
                active.needs_write = true;
                if active.flush_due_at.is_none() {
                    active.flush_due_at = Some(now_ms + self.config.debounce_ms);
                }
                Ok(())
            }
            _ => {
                // Updating a non-active experiment implicitly switches to it,
                // flushing whatever was pending.
                self.save_immediately().await?;
                self.active = Some(ActiveExperiment {
                    doc,
                    needs_write: true,
                    flush_due_at: Some(now_ms + self.config.debounce_ms),
                });
                Ok(())
            }
        }
    }

    /// Create a new experiment on disk and make it the active one.
    /// New experiments are written immediately, not debounced.
    pub async fn create_new_experiment(&mut self, doc: ExperimentDoc) -> Result<()> {
        self.save_immediately().await?;

        self.fs
            .write(&experiment_file(&doc.experiment_id), &doc.to_bytes()?)
            .await?;
        self.active = Some(ActiveExperiment {
            doc,
            needs_write: false,
            flush_due_at: None,
        });
        Ok(())
    }

    /// Delete an experiment's directory.
    ///
    /// If the experiment is the active one its pending write is discarded,
    /// not flushed; flushing would resurrect the file being deleted.
    pub async fn delete_experiment(&mut self, experiment_id: &str) -> Result<()> {
        if self.active_id() == Some(experiment_id) {
            self.active = None;
        }
        let dir = experiment_dir(experiment_id);
        if self.fs.exists(&dir).await? {
            self.fs.delete_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Flush the pending write, if any, right now.
    pub async fn save_immediately(&mut self) -> Result<()> {
        if let Some(active) = &mut self.active {
            if active.needs_write {
                self.fs
                    .write(
                        &experiment_file(&active.doc.experiment_id),
                        &active.doc.to_bytes()?,
                    )
                    .await?;
                active.needs_write = false;
                active.flush_due_at = None;
                debug!(experiment = %active.doc.experiment_id, "flushed experiment document");
            }
        }
        Ok(())
    }

    /// Flush if the debounce deadline has passed. Call periodically.
    pub async fn tick(&mut self, now_ms: u64) -> Result<()> {
        let due = self
            .active
            .as_ref()
            .and_then(|a| a.flush_due_at)
            .is_some_and(|deadline| now_ms >= deadline);
        if due {
            self.save_immediately().await?;
        }
        Ok(())
    }
}
