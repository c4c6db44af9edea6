//! SyncOrchestrator: the full library reconciliation pass.
//!
//! One pass fetches the remote library revision, merges library records,
//! classifies every known experiment (push, pull, merge, delete), executes
//! the resulting asset transfers, and persists updated library and tracker
//! state. Reconciliation is idempotent: a pass over already-converged
//! state takes a fast path that performs no remote writes, so retry after
//! any contained failure is simply the next pass.
//!
//! Failure containment follows scope: authentication failures abort the
//! pass, per-experiment failures skip that experiment and leave it dirty,
//! per-asset failures skip that transfer. Nothing is retried within a
//! pass; a failed download clears the experiment's `downloaded` flag,
//! which forces the next pass to re-plan the missing transfers.

use crate::events::{EventBus, SyncProgress, SyncState};
use crate::experiment::{DocumentError, ExperimentDoc, ExperimentMerger, LastWriterMerger};
use crate::fs::{FileSystem, FsError};
use crate::library::{ExperimentLibrary, LibraryError};
use crate::plan::{FileSyncPlan, plan_asset_transfers, plan_full_download, plan_full_upload};
use crate::remote::{RemoteError, RemoteStore};
use crate::status::{StatusError, SyncStatusTracker};
use crate::storage::{asset_file, experiment_dir, experiment_file};
use crate::upgrade::{UpgradeError, upgrade_to_current};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Remote name of the library package.
const LIBRARY_PACKAGE_NAME: &str = "library.json";

#[derive(Debug, Error)]
pub enum SyncError {
    /// Surfaced to the caller so a re-authentication flow can run.
    #[error("authentication required")]
    AuthRequired,

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AuthRequired => SyncError::AuthRequired,
            other => SyncError::Remote(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Counters describing what one pass did. Diagnostics only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Experiments merged with a changed remote copy.
    pub merged: usize,
    /// Experiment documents uploaded (first push or after merge).
    pub pushed: usize,
    /// Experiments discovered remotely and downloaded for the first time.
    pub downloaded_new: usize,
    /// Remote packages moved to the trash.
    pub remote_trashed: usize,
    /// Local experiment directories removed.
    pub locally_deleted: usize,
    /// Records that could not be reconciled this pass (races with other
    /// devices); skipped without fabricating state.
    pub unreconcilable: usize,
    /// Experiments skipped because their documents are from a newer build.
    pub schema_rejected: usize,
    /// Experiments skipped on transient network or IO errors.
    pub transient_failures: usize,
    /// Experiments skipped on rate-limit responses.
    pub rate_limited: usize,
    /// Individual asset transfers that failed.
    pub asset_failures: usize,
    /// Library revision recorded at the end of the pass.
    pub library_revision: i64,
}

/// True when some experiment has edits, archival changes, or asset
/// downloads still outstanding; such state forces a full pass even if
/// the remote library revision has not moved.
fn has_pending_local_changes(library: &ExperimentLibrary, tracker: &SyncStatusTracker) -> bool {
    library.known_experiments().iter().any(|id| {
        if tracker.is_dirty(id) {
            return true;
        }
        let Some(record) = library.get(id) else {
            return false;
        };
        if record.deleted {
            return false;
        }
        record.archived != tracker.server_archived(id)
            || (record.remote_file_id.is_some() && !tracker.is_downloaded(id))
    })
}

struct PendingPlan {
    experiment_id: String,
    file_id: String,
    plan: FileSyncPlan,
}

/// Drives reconciliation between the local store and the remote store.
pub struct SyncOrchestrator<F: FileSystem, R: RemoteStore> {
    fs: F,
    remote: R,
    merger: Arc<dyn ExperimentMerger>,
    events: Arc<EventBus>,
}

impl<F: FileSystem, R: RemoteStore> SyncOrchestrator<F, R> {
    pub fn new(fs: F, remote: R) -> Self {
        Self {
            fs,
            remote,
            merger: Arc::new(LastWriterMerger),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_merger(mut self, merger: Arc<dyn ExperimentMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Progress event bus; subscribe before starting a pass.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_library(&self) -> Result<SyncReport> {
        self.emit("library", SyncState::Syncing, 0, None);
        match self.run_pass().await {
            Ok(report) => {
                self.emit("library", SyncState::Complete, 100, None);
                Ok(report)
            }
            Err(err) => {
                self.emit("library", SyncState::Error, 100, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let mut library = ExperimentLibrary::load(&self.fs).await?;
        let mut tracker = SyncStatusTracker::load(&self.fs).await?;
        let mut report = SyncReport::default();

        let folder_id = match &library.folder_id {
            Some(id) => id.clone(),
            None => {
                let id = self.remote.get_or_create_root_folder().await?;
                library.folder_id = Some(id.clone());
                id
            }
        };

        // A device that has never synced discovers the library by name.
        if library.file_id.is_none() {
            library.file_id = self
                .remote
                .find_package(&folder_id, LIBRARY_PACKAGE_NAME)
                .await?;
        }

        // Fast path: the remote library has not moved since we last
        // reconciled and nothing local is waiting to go out, so only
        // sweep for remotely vanished experiments.
        if let Some(file_id) = &library.file_id {
            let remote_revision = match self.remote.package_revision(file_id).await {
                Ok(revision) => Some(revision),
                Err(RemoteError::NotFound(_)) => None,
                Err(err) => return Err(err.into()),
            };
            if remote_revision == Some(tracker.library_revision())
                && !has_pending_local_changes(&library, &tracker)
            {
                debug!(revision = tracker.library_revision(), "library unchanged, sweeping only");
                report.library_revision = tracker.library_revision();
                let changed = self
                    .deletion_sweep(&mut library, &mut tracker, &mut report)
                    .await?;
                if changed {
                    library.save(&self.fs).await?;
                    tracker.save(&self.fs).await?;
                }
                return Ok(report);
            }
        }

        // Merge the remote library into ours.
        if let Some(file_id) = &library.file_id {
            match self.remote.download_package(file_id).await {
                Ok(bytes) => {
                    let remote_library = ExperimentLibrary::from_bytes(&bytes)?;
                    library.merge_from(&remote_library);
                }
                Err(RemoteError::NotFound(_)) => {
                    // The library package was removed remotely; re-create
                    // it from local state at the end of the pass.
                    warn!(file_id = %file_id, "remote library package missing");
                    library.file_id = None;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let experiment_ids = library.known_experiments();
        for id in &experiment_ids {
            tracker.add_experiment(id);
        }

        // One round trip for every known remote revision.
        let file_ids: Vec<String> = experiment_ids
            .iter()
            .filter_map(|id| library.file_id_of(id))
            .collect();
        let revisions = self.remote.package_revisions(&file_ids).await?;

        let mut plans: Vec<PendingPlan> = Vec::new();
        let total = experiment_ids.len().max(1);
        for (position, id) in experiment_ids.iter().enumerate() {
            let percent = (position * 100 / total) as u8;
            self.emit(id, SyncState::Syncing, percent, None);

            let outcome = self
                .sync_experiment(
                    id,
                    &folder_id,
                    &revisions,
                    &mut library,
                    &mut tracker,
                    &mut report,
                    &mut plans,
                )
                .await;
            match outcome {
                Ok(()) => self.emit(id, SyncState::Complete, percent, None),
                Err(SyncError::AuthRequired) => return Err(SyncError::AuthRequired),
                Err(SyncError::Remote(RemoteError::RateLimited)) => {
                    report.rate_limited += 1;
                    self.emit(id, SyncState::Error, percent, Some("rate limited".into()));
                }
                Err(SyncError::Upgrade(UpgradeError::NewerVersion { .. })) => {
                    report.schema_rejected += 1;
                    self.emit(
                        id,
                        SyncState::Error,
                        percent,
                        Some("newer version detected".into()),
                    );
                }
                Err(err) => {
                    // Contained: the experiment stays dirty and the next
                    // pass retries it.
                    warn!(experiment = %id, error = %err, "experiment sync failed");
                    report.transient_failures += 1;
                    self.emit(id, SyncState::Error, percent, Some(err.to_string()));
                }
            }
        }

        self.execute_plans(plans, &mut tracker, &mut report).await;

        // Re-upload the library and record its new revision.
        let revision = match &library.file_id {
            Some(file_id) => self.remote.update_package(file_id, &library.to_bytes()?).await?,
            None => {
                let (file_id, _) = self
                    .remote
                    .create_package(&folder_id, LIBRARY_PACKAGE_NAME, &library.to_bytes()?)
                    .await?;
                debug!(file_id = %file_id, "created remote library package");
                library.file_id = Some(file_id.clone());
                // The uploaded copy must carry its own file id.
                self.remote.update_package(&file_id, &library.to_bytes()?).await?
            }
        };
        tracker.set_library_revision(revision);
        report.library_revision = revision;

        self.cleanup_sweep(&library, &mut tracker, &mut report).await;

        library.save(&self.fs).await?;
        tracker.save(&self.fs).await?;

        info!(
            pushed = report.pushed,
            merged = report.merged,
            downloaded = report.downloaded_new,
            revision = report.library_revision,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Classify and reconcile one experiment. Errors are contained by the
    /// caller at experiment scope.
    #[allow(clippy::too_many_arguments)]
    async fn sync_experiment(
        &self,
        id: &str,
        folder_id: &str,
        revisions: &HashMap<String, i64>,
        library: &mut ExperimentLibrary,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
        plans: &mut Vec<PendingPlan>,
    ) -> Result<()> {
        let Some(record) = library.get(id).cloned() else {
            return Ok(());
        };
        let local_exists = self.fs.exists(&experiment_file(id)).await?;

        if record.deleted {
            return self
                .sync_deleted(id, &record.remote_file_id, local_exists, revisions, tracker, report)
                .await;
        }

        match (&record.remote_file_id, local_exists) {
            // Discovered remotely, never downloaded here.
            (Some(file_id), false) if revisions.contains_key(file_id) => {
                let revision = revisions[file_id];
                let bytes = self.remote.download_package(file_id).await?;
                let mut doc = ExperimentDoc::from_bytes(&bytes)?;
                upgrade_to_current(&mut doc)?;
                self.fs.write(&experiment_file(id), &doc.to_bytes()?).await?;

                tracker.set_last_synced_version(id, revision);
                tracker.set_dirty(id, false);
                tracker.set_server_archived(id, doc.archived);

                let plan = plan_full_download(&doc);
                tracker.set_downloaded(id, plan.is_empty());
                if !plan.is_empty() {
                    plans.push(PendingPlan {
                        experiment_id: id.to_string(),
                        file_id: file_id.clone(),
                        plan,
                    });
                }
                report.downloaded_new += 1;
                Ok(())
            }

            // Known remotely once, but the package is gone and we have no
            // local copy either. Tombstone the record.
            (Some(_), false) => {
                library.set_deleted(id, true);
                tracker.set_dirty(id, false);
                report.locally_deleted += 1;
                Ok(())
            }

            // Another device registered the experiment but has not
            // uploaded its package yet. Resolved by a later pass.
            (None, false) => {
                debug!(experiment = %id, "record has no package yet, skipping");
                Ok(())
            }

            // Local experiment never pushed.
            (None, true) => {
                let doc = self.load_local(id).await?;
                let (file_id, revision) = self
                    .remote
                    .create_package(folder_id, &format!("{}.json", id), &doc.to_bytes()?)
                    .await?;
                library.set_file_id(id, &file_id);

                tracker.set_last_synced_version(id, revision);
                tracker.set_dirty(id, false);
                tracker.set_server_archived(id, doc.archived);
                // Pushing: every referenced asset is already local.
                tracker.set_downloaded(id, true);

                let plan = plan_full_upload(&doc);
                if !plan.is_empty() {
                    plans.push(PendingPlan {
                        experiment_id: id.to_string(),
                        file_id,
                        plan,
                    });
                }
                report.pushed += 1;
                Ok(())
            }

            // Both sides have a copy.
            (Some(file_id), true) => match revisions.get(file_id) {
                // The remote package vanished (trashed elsewhere); the
                // local copy follows it.
                None => {
                    self.delete_local(id).await?;
                    library.set_deleted(id, true);
                    tracker.set_dirty(id, false);
                    report.locally_deleted += 1;
                    Ok(())
                }
                Some(&revision) => {
                    let remote_moved = revision != tracker.last_synced_version(id);
                    let content_settled = !remote_moved
                        && !tracker.is_dirty(id)
                        && tracker.server_archived(id) == record.archived;
                    if content_settled {
                        // Documents are reconciled; the only possible
                        // leftover is an asset transfer that failed on an
                        // earlier pass.
                        if !tracker.is_downloaded(id) {
                            let doc = self.load_local(id).await?;
                            let mut plan = FileSyncPlan::new();
                            self.add_missing_downloads(id, &doc, &mut plan).await?;
                            tracker.set_downloaded(id, plan.is_empty());
                            if !plan.is_empty() {
                                plans.push(PendingPlan {
                                    experiment_id: id.to_string(),
                                    file_id: file_id.clone(),
                                    plan,
                                });
                            }
                        }
                        return Ok(());
                    }
                    self.merge_experiment(id, file_id, remote_moved, library, tracker, report, plans)
                        .await
                }
            },
        }
    }

    async fn sync_deleted(
        &self,
        id: &str,
        file_id: &Option<String>,
        local_exists: bool,
        revisions: &HashMap<String, i64>,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
    ) -> Result<()> {
        match file_id {
            Some(file_id) => {
                if revisions.contains_key(file_id) {
                    self.remote.trash_package(file_id).await?;
                    report.remote_trashed += 1;
                }
                tracker.set_dirty(id, false);
            }
            None if !local_exists && tracker.is_dirty(id) => {
                // Deleted, never uploaded, and no local files: likely a
                // race with another device. Skip without fabricating
                // state.
                report.unreconcilable += 1;
                return Ok(());
            }
            None => tracker.set_dirty(id, false),
        }

        // A tombstoned experiment keeps no live local files.
        if local_exists {
            self.delete_local(id).await?;
            report.locally_deleted += 1;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_experiment(
        &self,
        id: &str,
        file_id: &str,
        remote_moved: bool,
        library: &mut ExperimentLibrary,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
        plans: &mut Vec<PendingPlan>,
    ) -> Result<()> {
        let local = self.load_local(id).await?;

        let bytes = self.remote.download_package(file_id).await?;
        let mut remote_doc = ExperimentDoc::from_bytes(&bytes)?;
        upgrade_to_current(&mut remote_doc)?;

        // If the remote copy has not moved since our last sync it holds
        // nothing we lack, so local content wins outright; otherwise the
        // merge policy decides.
        let mut merged = if remote_moved {
            self.merger.merge(&local, &remote_doc)
        } else {
            local.clone()
        };
        // Archival intent lives on the library record, which the library
        // merge has already settled; the document follows it.
        merged.archived = library.get(id).is_some_and(|r| r.archived);
        let mut plan = plan_asset_transfers(&local, &remote_doc);
        // Also re-fetch referenced assets missing on disk, e.g. downloads
        // that failed on an earlier pass. The reference diff alone cannot
        // see those once both documents agree.
        self.add_missing_downloads(id, &merged, &mut plan).await?;

        self.fs.write(&experiment_file(id), &merged.to_bytes()?).await?;
        let revision = self.remote.update_package(file_id, &merged.to_bytes()?).await?;

        tracker.set_last_synced_version(id, revision);
        tracker.set_dirty(id, false);
        tracker.set_server_archived(id, merged.archived);
        tracker.set_downloaded(id, plan.download_count() == 0);

        if !plan.is_empty() {
            plans.push(PendingPlan {
                experiment_id: id.to_string(),
                file_id: file_id.to_string(),
                plan,
            });
        }
        if remote_moved {
            report.merged += 1;
        }
        report.pushed += 1;
        Ok(())
    }

    /// Execute queued asset transfers. Each transfer fails in isolation.
    async fn execute_plans(
        &self,
        plans: Vec<PendingPlan>,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
    ) {
        for pending in plans {
            let id = &pending.experiment_id;
            let mut upload_failures = 0usize;
            let mut download_failures = 0usize;

            for name in pending.plan.uploads() {
                let result = async {
                    let bytes = self.fs.read(&asset_file(id, name)).await?;
                    self.remote
                        .upload_asset(&pending.file_id, name, &bytes)
                        .await?;
                    Ok::<(), SyncError>(())
                }
                .await;
                if let Err(err) = result {
                    warn!(experiment = %id, asset = %name, error = %err, "asset upload failed");
                    upload_failures += 1;
                }
            }

            for name in pending.plan.downloads() {
                let result = async {
                    let bytes = self.remote.download_asset(&pending.file_id, name).await?;
                    self.fs.write(&asset_file(id, name), &bytes).await?;
                    Ok::<(), SyncError>(())
                }
                .await;
                if let Err(err) = result {
                    warn!(experiment = %id, asset = %name, error = %err, "asset download failed");
                    download_failures += 1;
                }
            }

            report.asset_failures += upload_failures + download_failures;
            // A failed download leaves the flag cleared so the next pass
            // re-plans the missing transfers.
            tracker.set_downloaded(id, download_failures == 0);
        }
    }

    /// Schedule downloads for referenced assets not present on disk.
    /// Picks up transfers that failed on an earlier pass.
    async fn add_missing_downloads(
        &self,
        id: &str,
        doc: &ExperimentDoc,
        plan: &mut FileSyncPlan,
    ) -> Result<()> {
        for image in &doc.image_ids {
            if !self.fs.exists(&asset_file(id, image)).await? {
                plan.add_image_download(image.clone());
            }
        }
        for sensor in doc.sensor_data_ids() {
            if !self.fs.exists(&asset_file(id, &sensor)).await? {
                plan.add_trial_download(sensor);
            }
        }
        Ok(())
    }

    /// Remove local copies of non-deleted experiments whose remote package
    /// no longer exists. Runs alone on the fast path.
    async fn deletion_sweep(
        &self,
        library: &mut ExperimentLibrary,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let candidates: Vec<(String, String)> = library
            .known_experiments()
            .into_iter()
            .filter(|id| library.get(id).is_some_and(|r| !r.deleted))
            .filter_map(|id| library.file_id_of(&id).map(|fid| (id, fid)))
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        let file_ids: Vec<String> = candidates.iter().map(|(_, fid)| fid.clone()).collect();
        let revisions = self.remote.package_revisions(&file_ids).await?;

        let mut changed = false;
        for (id, file_id) in candidates {
            if !revisions.contains_key(&file_id) {
                info!(experiment = %id, "remote package gone, deleting local copy");
                self.delete_local(&id).await?;
                library.set_deleted(&id, true);
                tracker.set_dirty(&id, false);
                report.locally_deleted += 1;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Final sweep: trash any deleted-and-dirty remnant and clear its
    /// dirty bit. A safety net for records tombstoned mid-pass.
    async fn cleanup_sweep(
        &self,
        library: &ExperimentLibrary,
        tracker: &mut SyncStatusTracker,
        report: &mut SyncReport,
    ) {
        for id in library.known_experiments() {
            let deleted = library.get(&id).is_some_and(|r| r.deleted);
            if !deleted || !tracker.is_dirty(&id) {
                continue;
            }
            if let Some(file_id) = library.file_id_of(&id) {
                match self.remote.trash_package(&file_id).await {
                    Ok(()) => report.remote_trashed += 1,
                    Err(RemoteError::NotFound(_)) => {}
                    Err(err) => {
                        warn!(experiment = %id, error = %err, "cleanup trash failed");
                        continue;
                    }
                }
            }
            tracker.set_dirty(&id, false);
        }
    }

    /// Load a local document through the upgrade ladder, writing the
    /// upgraded form back so disk never lags the stamp in memory.
    async fn load_local(&self, id: &str) -> Result<ExperimentDoc> {
        let bytes = self.fs.read(&experiment_file(id)).await?;
        let mut doc = ExperimentDoc::from_bytes(&bytes)?;
        let outcome = upgrade_to_current(&mut doc)?;
        if outcome.changed() {
            self.fs.write(&experiment_file(id), &doc.to_bytes()?).await?;
        }
        Ok(doc)
    }

    async fn delete_local(&self, id: &str) -> Result<()> {
        let dir = experiment_dir(id);
        if self.fs.exists(&dir).await? {
            self.fs.delete_dir_all(&dir).await?;
        } else if self.fs.exists(&experiment_file(id)).await? {
            self.fs.delete(&experiment_file(id)).await?;
        }
        Ok(())
    }

    fn emit(&self, id: &str, state: SyncState, percent: u8, error: Option<String>) {
        self.events.emit(SyncProgress {
            id: id.to_string(),
            state,
            percent,
            error,
        });
    }
}
