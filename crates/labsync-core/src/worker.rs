//! Background sync worker with request coalescing.
//!
//! One pass runs at a time. Requests arriving while a pass is in flight
//! collapse into a single follow-up pass carrying the latest request's
//! parameters, so N rapid triggers cost at most one extra pass instead of
//! N queued ones.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What prompted a sync pass. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncTrigger {
    #[default]
    Manual,
    LocalEdit,
    Periodic,
    Startup,
}

/// Parameters of one sync request. When requests coalesce, the latest
/// one's parameters win.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub trigger: SyncTrigger,
}

impl SyncRequest {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self { trigger }
    }
}

/// One reconciliation pass. Implemented over `SyncOrchestrator` in
/// production; tests substitute counting fakes.
#[async_trait]
pub trait SyncPass: Send {
    async fn run(&mut self, request: SyncRequest);
}

/// Handle to a running sync worker.
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncRequest>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask for a sync pass. Cheap and non-blocking; requests made while a
    /// pass is running coalesce into one follow-up pass.
    pub fn request_sync(&self, request: SyncRequest) {
        // A closed channel means the worker is shutting down; the request
        // is moot.
        let _ = self.tx.send(request);
    }

    /// Stop the worker after the in-flight pass, if any, completes.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

/// Spawns the worker loop on the current Tokio runtime.
pub struct SyncWorker;

impl SyncWorker {
    pub fn spawn<P: SyncPass + 'static>(mut pass: P) -> SyncHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncRequest>();

        let task = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                // Collapse everything queued while we were idle or running
                // into this one pass, keeping the newest parameters.
                let mut request = first;
                let mut collapsed = 0usize;
                while let Ok(newer) = rx.try_recv() {
                    request = newer;
                    collapsed += 1;
                }
                if collapsed > 0 {
                    debug!(collapsed, "coalesced sync requests");
                }

                pass.run(request).await;
            }
            info!("sync worker stopped");
        });

        SyncHandle { tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Pass that blocks until released, counting runs.
    struct GatedPass {
        runs: Arc<AtomicUsize>,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SyncPass for GatedPass {
        async fn run(&mut self, _request: SyncRequest) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_requests_during_pass_coalesce_to_one_follow_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let handle = SyncWorker::spawn(GatedPass {
            runs: Arc::clone(&runs),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        handle.request_sync(SyncRequest::new(SyncTrigger::Manual));
        started.notified().await;

        // Five triggers while the first pass is in flight.
        for _ in 0..5 {
            handle.request_sync(SyncRequest::new(SyncTrigger::LocalEdit));
        }

        release.notify_one(); // finish first pass
        started.notified().await; // the single follow-up pass starts
        release.notify_one(); // let it finish

        handle.shutdown().await;

        // Exactly two passes total, not six.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    /// Pass that records which trigger each run carried.
    struct RecordingPass {
        triggers: Arc<std::sync::Mutex<Vec<SyncTrigger>>>,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SyncPass for RecordingPass {
        async fn run(&mut self, request: SyncRequest) {
            self.triggers.lock().unwrap().push(request.trigger);
            self.started.notify_one();
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_latest_request_parameters_win() {
        let triggers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let handle = SyncWorker::spawn(RecordingPass {
            triggers: Arc::clone(&triggers),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        handle.request_sync(SyncRequest::new(SyncTrigger::Startup));
        started.notified().await;

        handle.request_sync(SyncRequest::new(SyncTrigger::LocalEdit));
        handle.request_sync(SyncRequest::new(SyncTrigger::Periodic));

        release.notify_one();
        started.notified().await;
        release.notify_one();

        handle.shutdown().await;

        let seen = triggers.lock().unwrap().clone();
        assert_eq!(seen, vec![SyncTrigger::Startup, SyncTrigger::Periodic]);
    }

    struct CountingPass {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SyncPass for CountingPass {
        async fn run(&mut self, _request: SyncRequest) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_request() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = SyncWorker::spawn(CountingPass {
            runs: Arc::clone(&runs),
        });

        handle.request_sync(SyncRequest::default());
        handle.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
