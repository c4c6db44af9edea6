//! End-to-end reconciliation tests.
//!
//! Exercises the full engine the way an app would: edits flow through the
//! ExperimentCache, reconciliation runs through the SyncOrchestrator, and
//! two simulated devices converge through a shared remote store.

use std::sync::Arc;

use labsync_core::cache::ExperimentCache;
use labsync_core::experiment::ExperimentDoc;
use labsync_core::fs::{FileSystem, InMemoryFs};
use labsync_core::library::ExperimentLibrary;
use labsync_core::orchestrator::SyncOrchestrator;
use labsync_core::remote::InMemoryRemote;
use labsync_core::status::SyncStatusTracker;
use labsync_core::storage::{asset_file, experiment_file};
use labsync_core::worker::{SyncPass, SyncRequest, SyncTrigger, SyncWorker};

/// One simulated device: its own local files, sharing the remote store.
struct Device {
    fs: Arc<InMemoryFs>,
    orchestrator: SyncOrchestrator<Arc<InMemoryFs>, Arc<InMemoryRemote>>,
}

impl Device {
    fn new(remote: &Arc<InMemoryRemote>) -> Self {
        let fs = Arc::new(InMemoryFs::new());
        let orchestrator = SyncOrchestrator::new(Arc::clone(&fs), Arc::clone(remote));
        Self { fs, orchestrator }
    }

    fn cache(&self) -> ExperimentCache<Arc<InMemoryFs>> {
        ExperimentCache::new(Arc::clone(&self.fs))
    }

    /// Create an experiment through the cache and register it for sync.
    async fn create_experiment(&self, title: &str) -> String {
        let doc = ExperimentDoc::new(title, 1_000);
        let id = doc.experiment_id.clone();

        let mut cache = self.cache();
        cache.create_new_experiment(doc).await.unwrap();

        let mut library = ExperimentLibrary::load(&self.fs).await.unwrap();
        library.add_experiment(&id);
        library.set_modified(&id, Some(1_000));
        library.save(&self.fs).await.unwrap();

        let mut tracker = SyncStatusTracker::load(&self.fs).await.unwrap();
        tracker.set_dirty(&id, true);
        tracker.save(&self.fs).await.unwrap();

        id
    }

    /// Edit the experiment document and mark it dirty.
    async fn edit_experiment(&self, id: &str, mutate: impl FnOnce(&mut ExperimentDoc)) {
        let mut cache = self.cache();
        let mut doc = cache.get_experiment(id).await.unwrap();
        mutate(&mut doc);
        cache.update_experiment(doc, 1_000).await.unwrap();
        cache.save_immediately().await.unwrap();

        let mut tracker = SyncStatusTracker::load(&self.fs).await.unwrap();
        tracker.set_dirty(id, true);
        tracker.save(&self.fs).await.unwrap();
    }

    async fn doc(&self, id: &str) -> ExperimentDoc {
        let bytes = self.fs.read(&experiment_file(id)).await.unwrap();
        ExperimentDoc::from_bytes(&bytes).unwrap()
    }
}

#[tokio::test]
async fn test_two_devices_converge() {
    let remote = Arc::new(InMemoryRemote::new());
    let device_a = Device::new(&remote);
    let device_b = Device::new(&remote);

    // Device A records an experiment with an image and pushes it.
    let id = device_a.create_experiment("Bean sprouting").await;
    device_a
        .fs
        .write(&asset_file(&id, "cover.jpg"), b"jpeg")
        .await
        .unwrap();
    device_a
        .edit_experiment(&id, |doc| doc.image_ids.push("cover.jpg".into()))
        .await;
    device_a.orchestrator.reconcile_library().await.unwrap();

    // Device B pulls everything down.
    let report = device_b.orchestrator.reconcile_library().await.unwrap();
    assert_eq!(report.downloaded_new, 1);
    assert_eq!(device_b.doc(&id).await.title, "Bean sprouting");
    assert_eq!(
        device_b.fs.read(&asset_file(&id, "cover.jpg")).await.unwrap(),
        b"jpeg"
    );

    // Device B renames the experiment; A picks the rename up.
    device_b
        .edit_experiment(&id, |doc| doc.title = "Bean sprouting (week 2)".into())
        .await;
    device_b.orchestrator.reconcile_library().await.unwrap();
    let report = device_a.orchestrator.reconcile_library().await.unwrap();

    assert_eq!(report.merged, 1);
    assert_eq!(device_a.doc(&id).await.title, "Bean sprouting (week 2)");

    // Both trackers agree on the same revision.
    let tracker_a = SyncStatusTracker::load(&device_a.fs).await.unwrap();
    assert!(!tracker_a.is_dirty(&id));
    assert!(tracker_a.last_synced_version(&id) > 0);
}

#[tokio::test]
async fn test_concurrent_edits_union_assets() {
    let remote = Arc::new(InMemoryRemote::new());
    let device_a = Device::new(&remote);
    let device_b = Device::new(&remote);

    let id = device_a.create_experiment("Shared").await;
    device_a.orchestrator.reconcile_library().await.unwrap();
    device_b.orchestrator.reconcile_library().await.unwrap();

    // A and B each add a different image while offline.
    device_a
        .fs
        .write(&asset_file(&id, "a.jpg"), b"from a")
        .await
        .unwrap();
    device_a
        .edit_experiment(&id, |doc| doc.image_ids.push("a.jpg".into()))
        .await;
    device_b
        .fs
        .write(&asset_file(&id, "b.jpg"), b"from b")
        .await
        .unwrap();
    device_b
        .edit_experiment(&id, |doc| doc.image_ids.push("b.jpg".into()))
        .await;

    // A pushes first, then B merges, then A catches up.
    device_a.orchestrator.reconcile_library().await.unwrap();
    device_b.orchestrator.reconcile_library().await.unwrap();
    device_a.orchestrator.reconcile_library().await.unwrap();

    // Neither image was dropped anywhere.
    for device in [&device_a, &device_b] {
        let doc = device.doc(&id).await;
        assert!(doc.image_ids.contains(&"a.jpg".to_string()));
        assert!(doc.image_ids.contains(&"b.jpg".to_string()));
        assert_eq!(
            device.fs.read(&asset_file(&id, "a.jpg")).await.unwrap(),
            b"from a"
        );
        assert_eq!(
            device.fs.read(&asset_file(&id, "b.jpg")).await.unwrap(),
            b"from b"
        );
    }
}

#[tokio::test]
async fn test_deletion_propagates_between_devices() {
    let remote = Arc::new(InMemoryRemote::new());
    let device_a = Device::new(&remote);
    let device_b = Device::new(&remote);

    let id = device_a.create_experiment("Doomed").await;
    device_a.orchestrator.reconcile_library().await.unwrap();
    device_b.orchestrator.reconcile_library().await.unwrap();

    // Device B deletes the experiment and syncs.
    let mut cache = device_b.cache();
    cache.delete_experiment(&id).await.unwrap();
    let mut library = ExperimentLibrary::load(&device_b.fs).await.unwrap();
    library.set_deleted(&id, true);
    library.save(&device_b.fs).await.unwrap();
    let mut tracker = SyncStatusTracker::load(&device_b.fs).await.unwrap();
    tracker.set_dirty(&id, true);
    tracker.save(&device_b.fs).await.unwrap();

    let report = device_b.orchestrator.reconcile_library().await.unwrap();
    assert_eq!(report.remote_trashed, 1);

    // Device A observes the tombstone and drops its local copy.
    device_a.orchestrator.reconcile_library().await.unwrap();
    assert!(!device_a.fs.exists(&experiment_file(&id)).await.unwrap());
    let library_a = ExperimentLibrary::load(&device_a.fs).await.unwrap();
    assert!(library_a.get(&id).unwrap().deleted);
}

/// Pass adapter wiring the orchestrator into the background worker.
struct OrchestratorPass {
    orchestrator: SyncOrchestrator<Arc<InMemoryFs>, Arc<InMemoryRemote>>,
    passes: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait::async_trait]
impl SyncPass for OrchestratorPass {
    async fn run(&mut self, _request: SyncRequest) {
        let _ = self.orchestrator.reconcile_library().await;
        self.passes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_worker_drives_reconciliation() {
    use std::sync::atomic::Ordering;

    let remote = Arc::new(InMemoryRemote::new());
    let device = Device::new(&remote);
    device.create_experiment("Driven by worker").await;

    let passes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let handle = SyncWorker::spawn(OrchestratorPass {
        orchestrator: SyncOrchestrator::new(Arc::clone(&device.fs), Arc::clone(&remote)),
        passes: Arc::clone(&passes),
    });

    handle.request_sync(SyncRequest::new(SyncTrigger::Startup));
    handle.shutdown().await;

    assert_eq!(passes.load(Ordering::SeqCst), 1);
    // The experiment and the library both reached the remote store.
    assert_eq!(remote.live_package_count(), 2);
    let tracker = SyncStatusTracker::load(&device.fs).await.unwrap();
    assert!(tracker.library_revision() > 0);
}
