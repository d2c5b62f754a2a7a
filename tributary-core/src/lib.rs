//! Tributary Core - stream extraction pipeline for a chat bot
//!
//! This crate provides the building blocks for pulling audio and subtitle
//! streams out of user-submitted videos: admission control, verified
//! downloads, progress tracking, ffprobe/ffmpeg integration, the selection
//! state machine, uploads and status reporting.

pub mod admission;
pub mod config;
pub mod format;
pub mod ids;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod selection;
pub mod status;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracing_setup;
pub mod transfer;
pub mod transport;
pub mod upload;

use std::path::PathBuf;

// Re-export main types for convenient access
pub use admission::{AdmissionController, AdmissionRejection, SlotGuard};
pub use config::TributaryConfig;
pub use ids::{ChatId, CorrelationId, MessageId, MessageRef, Requester, UserId};
pub use media::{ExtractError, ProbeError, ToolError};
pub use pipeline::{PipelineCoordinator, PipelineServices, PipelineState, StateError};
pub use progress::{ProgressError, ProgressRegistry};
pub use selection::SelectionError;
pub use storage::{StorageError, WorkDir};
pub use transfer::TransferError;
pub use transport::{KeyboardError, MessagingTransport, TransportError};
pub use upload::UploadError;

/// Errors that can bubble up from any Tributary subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TributaryError {
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionRejection),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Pipeline state error: {0}")]
    State(#[from] StateError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Invalid callback: {0}")]
    Keyboard(#[from] KeyboardError),

    #[error("Working directory {path} is unavailable: {source}")]
    WorkDirUnavailable {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
}

impl TributaryError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TributaryError::Admission(rejection) => match rejection {
                AdmissionRejection::PerUserLimitExceeded { limit, .. } => {
                    format!("You already have {limit} transfers running")
                }
                AdmissionRejection::GlobalCapacityExceeded { .. } => {
                    "The server is busy, try again later".to_string()
                }
                AdmissionRejection::LowDiskSpace { .. } => "Server disk space is low".to_string(),
                AdmissionRejection::StorageUnavailable { .. } => {
                    "Server storage is unavailable".to_string()
                }
            },
            TributaryError::Transfer(e) => match e {
                TransferError::RetriesExhausted {
                    file_name,
                    attempts,
                    ..
                } => format!("Failed to download {file_name} after {attempts} attempts"),
                TransferError::SizeMismatch { file_name, .. } => {
                    format!("File size mismatch for {file_name}")
                }
                _ => "Download error occurred".to_string(),
            },
            TributaryError::Probe(_) => "Could not read the file's streams".to_string(),
            TributaryError::Extract(e) if e.is_source_missing() => {
                "The source file is no longer available".to_string()
            }
            TributaryError::Extract(_) => "Stream extraction failed".to_string(),
            TributaryError::Upload(_) => "Upload failed".to_string(),
            TributaryError::Selection(_) => "Details not found".to_string(),
            TributaryError::State(_) => "This request is no longer available".to_string(),
            TributaryError::Progress(_) => "A transfer is already running".to_string(),
            TributaryError::Storage(_) | TributaryError::WorkDirUnavailable { .. } => {
                "Storage error occurred".to_string()
            }
            TributaryError::Transport(_) => "Messaging error occurred".to_string(),
            TributaryError::Tool(_) => "Media tool error occurred".to_string(),
            TributaryError::Keyboard(_) => "Unknown action".to_string(),
        }
    }

    /// Checks if this error is caused by the user rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TributaryError::Admission(AdmissionRejection::PerUserLimitExceeded { .. })
                | TributaryError::Selection(_)
                | TributaryError::Keyboard(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TributaryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let error = TributaryError::from(TransferError::RetriesExhausted {
            file_name: "movie.mkv".to_string(),
            attempts: 5,
            last: "connection reset".to_string(),
        });
        assert_eq!(
            error.user_message(),
            "Failed to download movie.mkv after 5 attempts"
        );
        assert!(!error.is_user_error());

        let error = TributaryError::from(SelectionError::NotFound {
            correlation_id: CorrelationId::new("1-2"),
        });
        assert!(error.is_user_error());
    }
}
