//! FileSyncPlan: asset transfers computed by a merge.
//!
//! A plan is produced while merging one experiment and consumed right after
//! by the orchestrator; it never outlives a reconciliation pass. Asset
//! references are unioned, never dropped: an asset only one side knows
//! about is scheduled for transfer toward the other side.

use crate::experiment::ExperimentDoc;
use std::collections::BTreeSet;

/// Accumulated asset transfers for one experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSyncPlan {
    image_uploads: BTreeSet<String>,
    image_downloads: BTreeSet<String>,
    trial_uploads: BTreeSet<String>,
    trial_downloads: BTreeSet<String>,
}

impl FileSyncPlan {
    pub fn new() -> Self {
        Self::default()
    }

    // Add-only mutators; a plan never forgets a transfer.

    pub fn add_image_upload(&mut self, name: impl Into<String>) {
        self.image_uploads.insert(name.into());
    }

    pub fn add_image_download(&mut self, name: impl Into<String>) {
        self.image_downloads.insert(name.into());
    }

    pub fn add_trial_upload(&mut self, name: impl Into<String>) {
        self.trial_uploads.insert(name.into());
    }

    pub fn add_trial_download(&mut self, name: impl Into<String>) {
        self.trial_downloads.insert(name.into());
    }

    /// All asset names to upload (images, then trial data).
    pub fn uploads(&self) -> impl Iterator<Item = &str> {
        self.image_uploads
            .iter()
            .chain(self.trial_uploads.iter())
            .map(String::as_str)
    }

    /// All asset names to download (images, then trial data).
    pub fn downloads(&self) -> impl Iterator<Item = &str> {
        self.image_downloads
            .iter()
            .chain(self.trial_downloads.iter())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.transfer_count() == 0
    }

    pub fn transfer_count(&self) -> usize {
        self.image_uploads.len()
            + self.image_downloads.len()
            + self.trial_uploads.len()
            + self.trial_downloads.len()
    }

    pub fn download_count(&self) -> usize {
        self.image_downloads.len() + self.trial_downloads.len()
    }

    pub fn contains_image_upload(&self, name: &str) -> bool {
        self.image_uploads.contains(name)
    }

    pub fn contains_image_download(&self, name: &str) -> bool {
        self.image_downloads.contains(name)
    }
}

/// Compute the asset union between a local and a remote document.
///
/// Local-only assets become uploads, remote-only assets become downloads.
/// Assets both sides reference are already in place on both ends.
pub fn plan_asset_transfers(local: &ExperimentDoc, remote: &ExperimentDoc) -> FileSyncPlan {
    let mut plan = FileSyncPlan::new();

    for image in &local.image_ids {
        if !remote.image_ids.contains(image) {
            plan.add_image_upload(image.clone());
        }
    }
    for image in &remote.image_ids {
        if !local.image_ids.contains(image) {
            plan.add_image_download(image.clone());
        }
    }

    let local_sensor = local.sensor_data_ids();
    let remote_sensor = remote.sensor_data_ids();
    for id in &local_sensor {
        if !remote_sensor.contains(id) {
            plan.add_trial_upload(id.clone());
        }
    }
    for id in &remote_sensor {
        if !local_sensor.contains(id) {
            plan.add_trial_download(id.clone());
        }
    }

    plan
}

/// Plan that downloads everything a remote document references.
/// Used when an experiment is first discovered remotely.
pub fn plan_full_download(remote: &ExperimentDoc) -> FileSyncPlan {
    let mut plan = FileSyncPlan::new();
    for image in &remote.image_ids {
        plan.add_image_download(image.clone());
    }
    for id in remote.sensor_data_ids() {
        plan.add_trial_download(id);
    }
    plan
}

/// Plan that uploads everything a local document references.
/// Used when an experiment is pushed for the first time.
pub fn plan_full_upload(local: &ExperimentDoc) -> FileSyncPlan {
    let mut plan = FileSyncPlan::new();
    for image in &local.image_ids {
        plan.add_image_upload(image.clone());
    }
    for id in local.sensor_data_ids() {
        plan.add_trial_upload(id);
    }
    plan
}
