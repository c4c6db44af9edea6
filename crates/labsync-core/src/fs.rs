//! FileSystem trait abstraction for platform-independent file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in labsync-fs) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync` for use across threads.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a directory and everything under it
    async fn delete_dir_all(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

#[derive(Default)]
struct InMemoryState {
    /// path -> (content, mtime in ms)
    files: HashMap<String, (Vec<u8>, u64)>,
    dirs: HashSet<String>,
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    state: RwLock<InMemoryState>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut state = InMemoryState::default();
        state.dirs.insert(String::new()); // Root directory
        Self {
            state: RwLock::new(state),
        }
    }

    /// Set a specific mtime for testing "latest wins" scenarios
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = normalize_path(path);
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state.files.get_mut(&path) {
            entry.1 = mtime;
        }
    }

    fn current_time_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        None
    } else {
        match normalized.rfind('/') {
            Some(pos) => Some(normalized[..pos].to_string()),
            None => Some(String::new()),
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        let state = self.state.read().unwrap();
        state
            .files
            .get(&path)
            .map(|(content, _)| content.clone())
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state.write().unwrap();

        // Create parent directories
        let mut parent = parent_path(&path);
        while let Some(dir) = parent {
            parent = parent_path(&dir);
            state.dirs.insert(dir);
        }

        state
            .files
            .insert(path, (content.to_vec(), Self::current_time_ms()));
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let state = self.state.read().unwrap();
        if !path.is_empty() && !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for file_path in state.files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in &state.dirs {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() {
                    let name = rest.split('/').next().unwrap();
                    if seen.insert(name.to_string()) {
                        entries.push(FileEntry {
                            name: name.to_string(),
                            is_dir: true,
                        });
                    }
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state.write().unwrap();

        if state.files.remove(&path).is_some() {
            return Ok(());
        }
        if state.dirs.remove(&path) {
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn delete_dir_all(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let prefix = format!("{}/", path);
        let mut state = self.state.write().unwrap();

        if !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        state.files.retain(|p, _| !p.starts_with(&prefix));
        state.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let state = self.state.read().unwrap();
        Ok(state.files.contains_key(&path) || state.dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize_path(path);
        let state = self.state.read().unwrap();

        if let Some((content, mtime)) = state.files.get(&path) {
            return Ok(FileStat {
                mtime_millis: *mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if state.dirs.contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut state = self.state.write().unwrap();

        let mut current = Some(path);
        while let Some(dir) = current {
            current = parent_path(&dir);
            state.dirs.insert(dir);
        }
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between the cache and orchestrator.
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn delete_dir_all(&self, path: &str) -> Result<()> {
        (**self).delete_dir_all(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.json", b"hello world").await.unwrap();

        let content = fs.read("test.json").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.json").await.unwrap());
        assert!(!fs.exists("nonexistent.json").await.unwrap());

        fs.delete("test.json").await.unwrap();
        assert!(!fs.exists("test.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        // Write creates parent directories
        fs.write("a/b/c.json", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.json");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_inmemory_fs_delete_dir_all() {
        let fs = InMemoryFs::new();

        fs.write("exp/e1/experiment.json", b"{}").await.unwrap();
        fs.write("exp/e1/assets/img.jpg", b"jpeg").await.unwrap();
        fs.write("exp/e2/experiment.json", b"{}").await.unwrap();

        fs.delete_dir_all("exp/e1").await.unwrap();

        assert!(!fs.exists("exp/e1").await.unwrap());
        assert!(!fs.exists("exp/e1/experiment.json").await.unwrap());
        assert!(!fs.exists("exp/e1/assets/img.jpg").await.unwrap());
        assert!(fs.exists("exp/e2/experiment.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_set_mtime() {
        let fs = InMemoryFs::new();

        fs.write("note.json", b"x").await.unwrap();
        fs.set_mtime("note.json", 42);

        let stat = fs.stat("note.json").await.unwrap();
        assert_eq!(stat.mtime_millis, 42);
    }
}
