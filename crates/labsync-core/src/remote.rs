//! RemoteStore trait abstraction for the versioned document store.
//!
//! The concrete client (authentication, HTTP, request retries) lives
//! outside this crate; the engine only sees this trait. Each experiment is
//! stored as a "package": a document plus its asset files, addressed by a
//! remote file id. The store assigns a monotonically increasing revision
//! number each time a package's document changes.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, with failure-injection hooks

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Failure taxonomy for remote calls.
///
/// `AuthRequired` aborts a reconciliation pass and is surfaced to the
/// caller; the others are contained at per-experiment or per-asset scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication required")]
    AuthRequired,

    #[error("network unavailable")]
    Offline,

    #[error("rate limited by remote store")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Versioned document storage with folder semantics.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get or create the well-known top-level container for this account.
    async fn get_or_create_root_folder(&self) -> Result<String>;

    /// Create a new package in a folder. Returns (file id, first revision).
    async fn create_package(&self, folder_id: &str, name: &str, content: &[u8])
    -> Result<(String, i64)>;

    /// Replace a package's document. Returns the new revision.
    async fn update_package(&self, file_id: &str, content: &[u8]) -> Result<i64>;

    /// Download a package's document bytes.
    async fn download_package(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Current revision of a single package.
    async fn package_revision(&self, file_id: &str) -> Result<i64>;

    /// Revisions for many packages in one round trip.
    /// Unknown or trashed file ids are simply absent from the result.
    async fn package_revisions(&self, file_ids: &[String]) -> Result<HashMap<String, i64>>;

    /// Whether a package exists (and is not trashed).
    async fn package_exists(&self, file_id: &str) -> Result<bool>;

    /// Look up a package by name within a folder.
    /// Used to discover well-known documents on a device that has never
    /// synced before.
    async fn find_package(&self, folder_id: &str, name: &str) -> Result<Option<String>>;

    /// Move a package to the trash.
    async fn trash_package(&self, file_id: &str) -> Result<()>;

    /// Upload an asset file into a package.
    async fn upload_asset(&self, file_id: &str, name: &str, content: &[u8]) -> Result<()>;

    /// Download an asset file from a package.
    async fn download_asset(&self, file_id: &str, name: &str) -> Result<Vec<u8>>;

    /// Count leftover containers from pre-package layouts. Diagnostics only.
    async fn count_legacy_folders(&self) -> Result<usize>;
}

struct Package {
    name: String,
    content: Vec<u8>,
    revision: i64,
    trashed: bool,
    assets: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct RemoteState {
    root_folder: Option<String>,
    packages: HashMap<String, Package>,
    next_id: u64,
    legacy_folders: usize,
    /// Error returned by the next remote call, then cleared.
    fail_next: Option<RemoteError>,
    /// Asset names whose transfers always fail.
    failing_assets: Vec<String>,
}

/// In-memory remote store for testing.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
        }
    }

    /// Make the next remote call fail with the given error.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    /// Pretend this account still has containers from a pre-package
    /// layout.
    pub fn set_legacy_folders(&self, count: usize) {
        self.state.lock().unwrap().legacy_folders = count;
    }

    /// Make every transfer of the named asset fail with `Offline`.
    pub fn fail_asset(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_assets
            .push(name.to_string());
    }

    /// Let transfers of the named asset succeed again.
    pub fn restore_asset(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_assets
            .retain(|n| n != name);
    }

    /// Number of packages not in the trash.
    pub fn live_package_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .packages
            .values()
            .filter(|p| !p.trashed)
            .count()
    }

    /// Whether a package is in the trash.
    pub fn is_trashed(&self, file_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .packages
            .get(file_id)
            .is_some_and(|p| p.trashed)
    }

    /// Asset bytes stored in a package, for assertions.
    pub fn asset_content(&self, file_id: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .packages
            .get(file_id)
            .and_then(|p| p.assets.get(name).cloned())
    }

    fn take_injected(state: &mut RemoteState) -> Result<()> {
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get_or_create_root_folder(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        if let Some(id) = &state.root_folder {
            return Ok(id.clone());
        }
        let id = "folder-root".to_string();
        state.root_folder = Some(id.clone());
        Ok(id)
    }

    async fn create_package(
        &self,
        _folder_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(String, i64)> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        state.next_id += 1;
        let file_id = format!("file-{}", state.next_id);
        state.packages.insert(
            file_id.clone(),
            Package {
                name: name.to_string(),
                content: content.to_vec(),
                revision: 1,
                trashed: false,
                assets: HashMap::new(),
            },
        );
        Ok((file_id, 1))
    }

    async fn update_package(&self, file_id: &str, content: &[u8]) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        let package = state
            .packages
            .get_mut(file_id)
            .filter(|p| !p.trashed)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        package.content = content.to_vec();
        package.revision += 1;
        Ok(package.revision)
    }

    async fn download_package(&self, file_id: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        state
            .packages
            .get(file_id)
            .filter(|p| !p.trashed)
            .map(|p| p.content.clone())
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }

    async fn package_revision(&self, file_id: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        state
            .packages
            .get(file_id)
            .filter(|p| !p.trashed)
            .map(|p| p.revision)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }

    async fn package_revisions(&self, file_ids: &[String]) -> Result<HashMap<String, i64>> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        let mut revisions = HashMap::new();
        for file_id in file_ids {
            if let Some(package) = state.packages.get(file_id) {
                if !package.trashed {
                    revisions.insert(file_id.clone(), package.revision);
                }
            }
        }
        Ok(revisions)
    }

    async fn package_exists(&self, file_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        Ok(state.packages.get(file_id).is_some_and(|p| !p.trashed))
    }

    async fn find_package(&self, _folder_id: &str, name: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        Ok(state
            .packages
            .iter()
            .find(|(_, p)| !p.trashed && p.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn trash_package(&self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;

        let package = state
            .packages
            .get_mut(file_id)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        package.trashed = true;
        Ok(())
    }

    async fn upload_asset(&self, file_id: &str, name: &str, content: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;
        if state.failing_assets.iter().any(|n| n == name) {
            return Err(RemoteError::Offline);
        }

        let package = state
            .packages
            .get_mut(file_id)
            .filter(|p| !p.trashed)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        package.assets.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    async fn download_asset(&self, file_id: &str, name: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected(&mut state)?;
        if state.failing_assets.iter().any(|n| n == name) {
            return Err(RemoteError::Offline);
        }

        state
            .packages
            .get(file_id)
            .filter(|p| !p.trashed)
            .and_then(|p| p.assets.get(name).cloned())
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", file_id, name)))
    }

    async fn count_legacy_folders(&self) -> Result<usize> {
        let state = self.state.lock().unwrap();
        Ok(state.legacy_folders)
    }
}

// Implement RemoteStore for Arc<T> where T: RemoteStore
// This allows sharing a remote client between the orchestrator and tests.
#[async_trait]
impl<T: RemoteStore + Send + Sync> RemoteStore for std::sync::Arc<T> {
    async fn get_or_create_root_folder(&self) -> Result<String> {
        (**self).get_or_create_root_folder().await
    }

    async fn create_package(
        &self,
        folder_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(String, i64)> {
        (**self).create_package(folder_id, name, content).await
    }

    async fn update_package(&self, file_id: &str, content: &[u8]) -> Result<i64> {
        (**self).update_package(file_id, content).await
    }

    async fn download_package(&self, file_id: &str) -> Result<Vec<u8>> {
        (**self).download_package(file_id).await
    }

    async fn package_revision(&self, file_id: &str) -> Result<i64> {
        (**self).package_revision(file_id).await
    }

    async fn package_revisions(&self, file_ids: &[String]) -> Result<HashMap<String, i64>> {
        (**self).package_revisions(file_ids).await
    }

    async fn package_exists(&self, file_id: &str) -> Result<bool> {
        (**self).package_exists(file_id).await
    }

    async fn find_package(&self, folder_id: &str, name: &str) -> Result<Option<String>> {
        (**self).find_package(folder_id, name).await
    }

    async fn trash_package(&self, file_id: &str) -> Result<()> {
        (**self).trash_package(file_id).await
    }

    async fn upload_asset(&self, file_id: &str, name: &str, content: &[u8]) -> Result<()> {
        (**self).upload_asset(file_id, name, content).await
    }

    async fn download_asset(&self, file_id: &str, name: &str) -> Result<Vec<u8>> {
        (**self).download_asset(file_id, name).await
    }

    async fn count_legacy_folders(&self) -> Result<usize> {
        (**self).count_legacy_folders().await
    }
}
