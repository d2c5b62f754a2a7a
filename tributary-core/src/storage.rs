//! Working directory layout and free-space inspection.
//!
//! Every pipeline stages its files under
//! `<work_dir>/tributary-work/<correlation>/`. Only that subdirectory is
//! wiped at start-up, since in-flight state does not survive a restart;
//! anything else under the configured root is left alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::Disks;

use crate::ids::CorrelationId;

/// Subdirectory of the configured root owned by the pipelines.
pub const STAGING_DIR: &str = "tributary-work";

/// Errors raised while managing the working directory or reading disk stats.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No mounted disk contains {path}")]
    NoMountPoint { path: PathBuf },

    #[error("Disk inspection of {path} did not complete: {reason}")]
    Interrupted { path: PathBuf, reason: String },
}

/// Source of free-space figures for the admission gate.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the disk holding `path`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NoMountPoint` - No known disk contains the path
    fn available_space(&self, path: &Path) -> Result<u64, StorageError>;
}

/// Runs `probe` on the blocking pool so slow filesystems never stall the
/// async workers.
///
/// # Errors
///
/// - `StorageError::Interrupted` - The blocking task panicked or was cancelled
/// - Any error returned by `probe`
pub async fn available_space_off_thread(
    probe: Arc<dyn DiskSpaceProbe>,
    path: PathBuf,
) -> Result<u64, StorageError> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || probe.available_space(&target))
        .await
        .unwrap_or_else(|e| {
            Err(StorageError::Interrupted {
                path,
                reason: e.to_string(),
            })
        })
}

/// Production probe backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskSpace;

impl DiskSpaceProbe for SysinfoDiskSpace {
    fn available_space(&self, path: &Path) -> Result<u64, StorageError> {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or(StorageError::NoMountPoint { path: resolved })
    }
}

/// Root directory holding every staged download and extraction output.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    staging: PathBuf,
}

impl WorkDir {
    /// Wraps an existing directory without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        Self { root, staging }
    }

    /// Creates the staging directory and removes leftovers of a previous run.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Directory cannot be created or listed
    pub async fn prepare(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let work_dir = Self::new(root);
        tokio::fs::create_dir_all(&work_dir.staging)
            .await
            .map_err(|source| StorageError::Io {
                path: work_dir.staging.clone(),
                source,
            })?;

        let removed = work_dir.purge_stale().await?;
        if removed > 0 {
            tracing::info!(
                "Removed {} leftover entries from {}",
                removed,
                work_dir.staging.display()
            );
        }
        Ok(work_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of every pipeline directory.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Directory reserved for one pipeline.
    pub fn transfer_dir(&self, correlation: &CorrelationId) -> PathBuf {
        self.staging.join(sanitize_file_name(correlation.as_str()))
    }

    /// Creates the pipeline directory if missing and returns it.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Directory cannot be created
    pub async fn create_transfer_dir(
        &self,
        correlation: &CorrelationId,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.transfer_dir(correlation);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Removes the pipeline directory and everything in it. Missing
    /// directories are fine; other failures are logged.
    pub async fn remove_transfer_dir(&self, correlation: &CorrelationId) {
        let dir = self.transfer_dir(correlation);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }

    /// Deletes every entry under the staging directory. Returns the number
    /// removed.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Staging directory cannot be listed
    pub async fn purge_stale(&self) -> Result<usize, StorageError> {
        let io_error = |source| StorageError::Io {
            path: self.staging.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.staging).await.map_err(io_error)?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove stale {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

/// Deletes a file, treating "already gone" as success. Other failures are
/// logged since cleanup must never abort a pipeline.
pub async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to delete {}: {}", path.display(), e),
    }
}

/// Replaces path separators and control characters so an inbound file name
/// can never escape its pipeline directory.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');

    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("movie.mkv"), "movie.mkv");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b:c"), "a_b_c");
        assert_eq!(sanitize_file_name("  "), "file");
        assert_eq!(sanitize_file_name("..."), "file");
    }

    struct PanickingDisk;

    impl DiskSpaceProbe for PanickingDisk {
        fn available_space(&self, _path: &Path) -> Result<u64, StorageError> {
            panic!("disk table unreadable");
        }
    }

    #[tokio::test]
    async fn test_available_space_off_thread() {
        let probe: Arc<dyn DiskSpaceProbe> = Arc::new(crate::testing::FixedDiskSpace::new(42));
        let available = available_space_off_thread(probe, PathBuf::from("/work"))
            .await
            .unwrap();
        assert_eq!(available, 42);

        let result = available_space_off_thread(Arc::new(PanickingDisk), PathBuf::from("/work")).await;
        assert!(matches!(result, Err(StorageError::Interrupted { path, .. }) if path == Path::new("/work")));
    }

    #[tokio::test]
    async fn test_prepare_purges_leftovers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("work");
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(staging.join("old-1")).unwrap();
        std::fs::write(staging.join("old-1/movie.mkv"), b"data").unwrap();
        std::fs::write(staging.join("stray.tmp"), b"data").unwrap();

        let work_dir = WorkDir::prepare(&root).await.unwrap();

        assert_eq!(work_dir.staging(), staging);
        assert!(staging.is_dir());
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_keeps_foreign_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("thesis.docx"), b"chapter one").unwrap();
        std::fs::create_dir_all(root.join("photos")).unwrap();
        std::fs::write(root.join("photos/beach.jpg"), b"jpeg").unwrap();

        let work_dir = WorkDir::prepare(root).await.unwrap();
        let dir = work_dir
            .create_transfer_dir(&CorrelationId::new("1-10"))
            .await
            .unwrap();
        drop(work_dir);
        std::fs::write(dir.join("movie.mkv"), b"data").unwrap();

        WorkDir::prepare(root).await.unwrap();

        assert_eq!(std::fs::read(root.join("thesis.docx")).unwrap(), b"chapter one");
        assert!(root.join("photos/beach.jpg").exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_prepare_fails_when_root_is_a_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blocker = temp_dir.path().join("work");
        std::fs::write(&blocker, b"file").unwrap();

        let result = WorkDir::prepare(&blocker).await;
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }

    #[tokio::test]
    async fn test_transfer_dir_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::prepare(temp_dir.path()).await.unwrap();
        let correlation = CorrelationId::new("-100-7");

        let dir = work_dir.create_transfer_dir(&correlation).await.unwrap();
        assert!(dir.starts_with(temp_dir.path()));
        assert!(dir.is_dir());

        work_dir.remove_transfer_dir(&correlation).await;
        assert!(!dir.exists());

        // Removing twice is harmless
        work_dir.remove_transfer_dir(&correlation).await;
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_quiet() {
        let temp_dir = tempfile::tempdir().unwrap();
        remove_file_quietly(&temp_dir.path().join("missing")).await;
    }
}
