//! Verified inbound transfers with bounded retries.
//!
//! A download is attempted up to `max_attempts` times. Each attempt starts
//! from zero; a failed or short attempt leaves nothing behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::TransferConfig;
use crate::ids::{CorrelationId, MessageRef};
use crate::progress::{Direction, ProgressError, ProgressRegistry};
use crate::storage::{StorageError, WorkDir, remove_file_quietly, sanitize_file_name};
use crate::transport::{InboundFile, MessagingTransport, TransportError, staging_path};

/// Errors raised by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Downloaded {actual} bytes of {file_name}, expected {expected}")]
    SizeMismatch {
        file_name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Download of {file_name} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        file_name: String,
        attempts: u32,
        last: String,
    },

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Cannot stage download: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// Downloads inbound files into the working directory.
#[derive(Clone)]
pub struct TransferEngine {
    transport: Arc<dyn MessagingTransport>,
    progress: ProgressRegistry,
    work_dir: WorkDir,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn MessagingTransport>,
        progress: ProgressRegistry,
        work_dir: WorkDir,
        config: TransferConfig,
    ) -> Self {
        Self {
            transport,
            progress,
            work_dir,
            config,
        }
    }

    /// Downloads `file` to `<work_dir>/<correlation>/<file name>`.
    ///
    /// Progress is published under `correlation_id` and displayed in
    /// `status_message`. A declared size of zero disables size verification.
    /// The caller owns the returned file.
    ///
    /// # Errors
    ///
    /// - `TransferError::RetriesExhausted` - Every attempt failed; no file remains
    /// - `TransferError::Storage` - Pipeline directory cannot be created
    /// - `TransferError::Progress` - A transfer is already running for this id
    pub async fn download(
        &self,
        correlation_id: &CorrelationId,
        file: &InboundFile,
        status_message: MessageRef,
    ) -> Result<PathBuf, TransferError> {
        let dir = self.work_dir.create_transfer_dir(correlation_id).await?;
        let destination = dir.join(sanitize_file_name(&file.file_name));
        let tracker = self.progress.begin(
            correlation_id,
            Direction::Download,
            &file.file_name,
            file.declared_size,
            status_message,
        )?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tracker.restart();
                if !self.config.retry_delay.is_zero() {
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }

            tracing::debug!(
                "Downloading {} for {} (attempt {}/{})",
                file.file_name,
                correlation_id,
                attempt,
                max_attempts
            );

            let callback = tracker.callback(self.config.progress_interval);
            let failure = match self
                .transport
                .download_file(file, &destination, Some(callback))
                .await
            {
                Ok(_) => match self.verify_size(file, &destination).await {
                    Ok(()) => {
                        tracing::info!(
                            "Downloaded {} ({} bytes) for {}",
                            file.file_name,
                            file.declared_size,
                            correlation_id
                        );
                        return Ok(destination);
                    }
                    Err(mismatch) => mismatch,
                },
                Err(TransportError::NotModified) => {
                    tracing::debug!("Ignoring not-modified response during download");
                    TransferError::Transport(TransportError::NotModified)
                }
                Err(e) => TransferError::Transport(e),
            };

            tracing::warn!(
                "Download attempt {}/{} of {} failed: {}",
                attempt,
                max_attempts,
                file.file_name,
                failure
            );
            last_failure = failure.to_string();
            remove_partial(&destination).await;
        }

        remove_partial(&destination).await;
        Err(TransferError::RetriesExhausted {
            file_name: file.file_name.clone(),
            attempts: max_attempts,
            last: last_failure,
        })
    }

    async fn verify_size(&self, file: &InboundFile, path: &Path) -> Result<(), TransferError> {
        let actual = tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);

        if file.declared_size == 0 || actual == file.declared_size {
            Ok(())
        } else {
            Err(TransferError::SizeMismatch {
                file_name: file.file_name.clone(),
                expected: file.declared_size,
                actual,
            })
        }
    }
}

async fn remove_partial(destination: &Path) {
    remove_file_quietly(destination).await;
    remove_file_quietly(&staging_path(destination)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChatId, MessageId};
    use crate::testing::{DownloadScript, ScriptedTransport};

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        transport: Arc<ScriptedTransport>,
        progress: ProgressRegistry,
        engine: TransferEngine,
        work_dir: WorkDir,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(temp_dir.path());
        let transport = Arc::new(ScriptedTransport::new());
        let progress = ProgressRegistry::new();
        let config = TransferConfig {
            max_attempts,
            ..crate::config::TributaryConfig::for_testing().transfer
        };
        let engine = TransferEngine::new(
            transport.clone(),
            progress.clone(),
            work_dir.clone(),
            config,
        );
        Fixture {
            _temp_dir: temp_dir,
            transport,
            progress,
            engine,
            work_dir,
        }
    }

    fn inbound(size: u64) -> InboundFile {
        InboundFile {
            file_id: "file-1".to_string(),
            file_name: "movie.mkv".to_string(),
            declared_size: size,
            mime_type: Some("video/x-matroska".to_string()),
            message: MessageRef::new(ChatId::new(1), MessageId::new(10)),
        }
    }

    fn status() -> MessageRef {
        MessageRef::new(ChatId::new(1), MessageId::new(11))
    }

    #[tokio::test]
    async fn test_successful_download() {
        let f = fixture(3);
        let id = CorrelationId::new("1-11");

        let path = f.engine.download(&id, &inbound(4096), status()).await.unwrap();

        assert_eq!(path, f.work_dir.transfer_dir(&id).join("movie.mkv"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(f.transport.download_attempts(), 1);
        assert_eq!(f.progress.active_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_mismatch_then_success() {
        let f = fixture(3);
        f.transport.script_download(DownloadScript::Short(100));
        let id = CorrelationId::new("1-11");

        let path = f.engine.download(&id, &inbound(4096), status()).await.unwrap();

        assert_eq!(f.transport.download_attempts(), 2);
        assert_eq!(std::fs::metadata(path).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_persistent_mismatch_exhausts_retries() {
        let f = fixture(4);
        for _ in 0..4 {
            f.transport.script_download(DownloadScript::Short(10));
        }
        let id = CorrelationId::new("1-11");

        let result = f.engine.download(&id, &inbound(4096), status()).await;

        assert!(matches!(
            result,
            Err(TransferError::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(f.transport.download_attempts(), 4);
        let dir = f.work_dir.transfer_dir(&id);
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
        assert_eq!(f.progress.active_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_removes_staging_file() {
        let f = fixture(2);
        f.transport
            .script_download(DownloadScript::Fail("connection reset".to_string()));
        f.transport.script_download(DownloadScript::NotModified);
        let id = CorrelationId::new("1-11");

        let result = f.engine.download(&id, &inbound(4096), status()).await;

        match result {
            Err(TransferError::RetriesExhausted { last, .. }) => {
                assert!(last.contains("not modified"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let dir = f.work_dir.transfer_dir(&id);
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_download_for_same_id_rejected() {
        let f = fixture(1);
        let id = CorrelationId::new("1-11");
        let _held = f
            .progress
            .begin(&id, Direction::Download, "movie.mkv", 1, status())
            .unwrap();

        let result = f.engine.download(&id, &inbound(4096), status()).await;
        assert!(matches!(result, Err(TransferError::Progress(_))));
        assert_eq!(f.transport.download_attempts(), 0);
    }
}
