//! Delivery of extracted streams to the requester and the audit chat.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AuditConfig;
use crate::ids::{ChatId, CorrelationId, MessageId, MessageRef, Requester};
use crate::media::{MetadataReader, StreamKind};
use crate::progress::{Direction, ProgressError, ProgressRegistry};
use crate::storage::remove_file_quietly;
use crate::transport::{MessagingTransport, OutboundFile, OutboundKind, TransportError};

/// Errors raised while delivering an artifact.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload to chat {chat} failed: {source}")]
    Primary {
        chat: ChatId,
        #[source]
        source: TransportError,
    },

    #[error("Audit copy to chat {chat} failed: {source}")]
    Audit {
        chat: ChatId,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// What happened to the audit copy.
#[derive(Debug)]
pub enum AuditOutcome {
    /// No audit chat configured
    Skipped,
    Delivered(MessageRef),
    /// Requester got the file but the audit chat did not
    Failed(UploadError),
}

/// Result of a successful primary delivery.
#[derive(Debug)]
pub struct UploadReceipt {
    pub delivered: MessageRef,
    pub audit: AuditOutcome,
}

/// One artifact to deliver.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub correlation_id: CorrelationId,
    pub artifact: PathBuf,
    pub kind: StreamKind,
    pub chat: ChatId,
    pub reply_to: Option<MessageId>,
    /// Message showing upload progress
    pub status_message: MessageRef,
    pub requester: Requester,
    pub caption: String,
}

/// Deletes the artifact exactly once.
///
/// [`ArtifactGuard::release`] removes it asynchronously. If the upload is
/// dropped first, the removal is handed to the blocking pool.
struct ArtifactGuard {
    path: PathBuf,
    armed: bool,
}

impl ArtifactGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    async fn release(mut self) {
        remove_file_quietly(&self.path).await;
        self.armed = false;
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || remove_artifact(&path));
            }
            Err(_) => remove_artifact(&path),
        }
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Deleted artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to delete {}: {}", path.display(), e),
    }
}

/// Sends extracted streams with progress tracking and an optional audit copy.
#[derive(Clone)]
pub struct UploadEngine {
    transport: Arc<dyn MessagingTransport>,
    progress: ProgressRegistry,
    metadata: MetadataReader,
    audit: AuditConfig,
    progress_interval: Duration,
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn MessagingTransport>,
        progress: ProgressRegistry,
        metadata: MetadataReader,
        audit: AuditConfig,
        progress_interval: Duration,
    ) -> Self {
        Self {
            transport,
            progress,
            metadata,
            audit,
            progress_interval,
        }
    }

    /// Delivers the artifact to the requester, then to the audit chat.
    ///
    /// The artifact is deleted before this returns, whatever the outcome.
    /// An audit failure does not fail the upload; it is reported in
    /// [`UploadReceipt::audit`].
    ///
    /// # Errors
    ///
    /// - `UploadError::Primary` - Requester's chat did not receive the file
    /// - `UploadError::Progress` - Another transfer is running for this id
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        let artifact = ArtifactGuard::new(request.artifact.clone());
        let result = self.deliver(&request).await;
        artifact.release().await;
        result
    }

    async fn deliver(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError> {
        let kind = match request.kind {
            StreamKind::Audio => OutboundKind::Audio(self.metadata.read(&request.artifact).await),
            StreamKind::Subtitle | StreamKind::Other => OutboundKind::Document,
        };
        let outbound = OutboundFile {
            path: request.artifact.clone(),
            kind,
            caption: primary_caption(&request.caption, &self.audit.signature),
        };

        let delivered = {
            let tracker = self.progress.begin(
                &request.correlation_id,
                Direction::Upload,
                &display_name(&request.artifact),
                file_size(&request.artifact).await,
                request.status_message,
            )?;
            self.transport
                .send_file(
                    request.chat,
                    &outbound,
                    request.reply_to,
                    Some(tracker.callback(self.progress_interval)),
                )
                .await
                .map_err(|source| UploadError::Primary {
                    chat: request.chat,
                    source,
                })?
        };
        tracing::info!(
            "Delivered {} to chat {} for {}",
            request.artifact.display(),
            request.chat,
            request.correlation_id
        );

        let audit = match self.audit.chat {
            None => AuditOutcome::Skipped,
            Some(chat) => self.send_audit_copy(chat, request, outbound).await,
        };

        Ok(UploadReceipt { delivered, audit })
    }

    async fn send_audit_copy(
        &self,
        chat: ChatId,
        request: &UploadRequest,
        outbound: OutboundFile,
    ) -> AuditOutcome {
        if !self.audit.pause.is_zero() {
            tokio::time::sleep(self.audit.pause).await;
        }

        let audit_file = OutboundFile {
            caption: audit_caption(&request.caption, &request.requester),
            ..outbound
        };
        match self
            .transport
            .send_file(chat, &audit_file, None, None)
            .await
        {
            Ok(message) => AuditOutcome::Delivered(message),
            Err(source) => {
                let error = UploadError::Audit { chat, source };
                tracing::warn!("{} ({})", error, request.correlation_id);
                AuditOutcome::Failed(error)
            }
        }
    }
}

fn primary_caption(caption: &str, signature: &str) -> String {
    if signature.is_empty() {
        caption.to_string()
    } else {
        format!("{caption}\n\n{signature}")
    }
}

/// Caption identifying who requested the file.
pub fn audit_caption(caption: &str, requester: &Requester) -> String {
    match &requester.username {
        Some(username) => format!(
            "{caption}\n\nRequested by {} (@{username}, id {})",
            requester.display_name(),
            requester.id
        ),
        None => format!(
            "{caption}\n\nRequested by {} (id {})",
            requester.display_name(),
            requester.id
        ),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}
