//! labsync-core: experiment metadata synchronization engine.
//!
//! This crate provides the core functionality for:
//! - Tracking per-experiment sync state (dirty bits, synced revisions)
//! - The experiment library index with tombstone-based deletion
//! - A write-coalescing cache with an on-load schema upgrade ladder
//! - Full library reconciliation against a versioned remote store
//! - A background worker that coalesces rapid sync triggers
//! - FileSystem and RemoteStore trait abstractions

pub mod cache;
pub mod events;
pub mod experiment;
pub mod fs;
pub mod library;
pub mod orchestrator;
pub mod plan;
pub mod remote;
pub mod status;
pub mod storage;
pub mod upgrade;
pub mod worker;

pub use cache::{CacheConfig, ExperimentCache};
pub use events::{EventBus, Subscription, SyncProgress, SyncState};
pub use experiment::{ExperimentDoc, ExperimentMerger, FileVersion, LastWriterMerger, Trial};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use library::{ExperimentLibrary, ExperimentRecord};
pub use orchestrator::{SyncError, SyncOrchestrator, SyncReport};
pub use plan::FileSyncPlan;
pub use remote::{InMemoryRemote, RemoteError, RemoteStore};
pub use status::SyncStatusTracker;
pub use worker::{SyncHandle, SyncPass, SyncRequest, SyncTrigger, SyncWorker};
