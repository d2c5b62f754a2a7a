//! Texts and keyboards shown to requesters.
//!
//! Every failure gets its own wording naming the file, so nothing fails
//! silently.

use crate::admission::AdmissionRejection;
use crate::format::format_bytes;
use crate::ids::{CorrelationId, Requester};
use crate::media::{ExtractError, ProbeError, StreamDescriptor, StreamKind};
use crate::selection::SelectionBucket;
use crate::transfer::TransferError;
use crate::transport::{Button, CallbackAction, InboundFile, Keyboard};
use crate::upload::{UploadError, audit_caption};

pub fn confirmation_prompt(file: &InboundFile) -> String {
    format!(
        "{} ({})\n\nDownload this file and list its audio and subtitle streams?",
        file.file_name,
        format_bytes(file.declared_size)
    )
}

pub fn confirmation_keyboard(correlation_id: &CorrelationId) -> Keyboard {
    Keyboard::new()
        .row(vec![Button::new(
            "Download and process",
            CallbackAction::Proceed {
                correlation_id: correlation_id.clone(),
            },
        )])
        .row(vec![Button::new(
            "Cancel",
            CallbackAction::Dismiss {
                correlation_id: correlation_id.clone(),
            },
        )])
}

pub fn invalid_media(file_name: &str, mime: Option<&str>) -> String {
    match mime {
        Some(mime) => format!("Invalid media: {file_name} is {mime}, only video files are accepted."),
        None => format!("Invalid media: the type of {file_name} is unknown, only video files are accepted."),
    }
}

pub fn downloading(file_name: &str) -> String {
    format!("Downloading {file_name} to the server...")
}

pub fn progress_keyboard(correlation_id: &CorrelationId) -> Keyboard {
    Keyboard::new().row(vec![Button::new(
        "Check progress",
        CallbackAction::ShowProgress {
            correlation_id: correlation_id.clone(),
        },
    )])
}

pub fn admission_rejected(file_name: &str, rejection: &AdmissionRejection) -> String {
    match rejection {
        AdmissionRejection::PerUserLimitExceeded { limit, .. } => format!(
            "Cannot start {file_name}: you already have {limit} transfers running. Try again when one finishes."
        ),
        AdmissionRejection::GlobalCapacityExceeded { .. } => {
            format!("Cannot start {file_name}: the server is busy. Try again later.")
        }
        AdmissionRejection::LowDiskSpace {
            available,
            required,
        } => format!(
            "Cannot start {file_name}: low disk space ({} free, {} needed).",
            format_bytes(*available),
            format_bytes(*required)
        ),
        AdmissionRejection::StorageUnavailable { .. } => {
            format!("Cannot start {file_name}: server storage is unavailable.")
        }
    }
}

pub fn transfer_failed(file_name: &str, error: &TransferError) -> String {
    match error {
        TransferError::RetriesExhausted { attempts, .. } => {
            format!("Failed to download {file_name} after {attempts} attempts.")
        }
        TransferError::SizeMismatch {
            expected, actual, ..
        } => format!(
            "File size mismatch for {file_name}. Original: {}, downloaded: {}.",
            format_bytes(*expected),
            format_bytes(*actual)
        ),
        TransferError::Storage(_) => format!(
            "Cannot download {file_name}: server storage is unavailable. Try again later."
        ),
        TransferError::Progress(_) => format!(
            "Cannot download {file_name}: another transfer for this file is still running."
        ),
        TransferError::Transport(_) => format!("Error while downloading {file_name}."),
    }
}

/// Caption of the source copy sent to the audit media chat.
pub fn source_audit_caption(file: &InboundFile, requester: &Requester) -> String {
    audit_caption(
        &format!("{} ({})", file.file_name, format_bytes(file.declared_size)),
        requester,
    )
}

pub fn probing(file_name: &str) -> String {
    format!("Processing {file_name}...")
}

pub fn probe_failed(file_name: &str, error: &ProbeError) -> String {
    if error.is_timeout() {
        format!("Reading the streams of {file_name} timed out. The file was removed.")
    } else {
        format!("Could not read the streams of {file_name}. The file was removed.")
    }
}

pub fn no_streams(file_name: &str) -> String {
    format!("{file_name} has no audio or subtitle streams to extract.")
}

pub fn selection_unavailable(file_name: &str) -> String {
    format!("Could not offer the streams of {file_name}. The file was removed.")
}

pub fn selection_prompt(bucket: &SelectionBucket) -> String {
    format!(
        "{}\n\nSelect the stream to extract ({} available).",
        bucket.source_name,
        bucket.len()
    )
}

/// One button per stream, audio first, then a cancel button.
pub fn selection_keyboard(bucket: &SelectionBucket) -> Keyboard {
    let button = |stream: &StreamDescriptor| {
        let prefix = match stream.kind {
            StreamKind::Audio => "Audio",
            StreamKind::Subtitle => "Subtitle",
            StreamKind::Other => "Stream",
        };
        Button::new(
            format!("{prefix}: {}", stream.label()),
            CallbackAction::Select {
                correlation_id: bucket.correlation_id.clone(),
                index: stream.index,
            },
        )
    };

    let mut keyboard = Keyboard::new();
    for kind in [StreamKind::Audio, StreamKind::Subtitle] {
        for stream in bucket.streams().filter(|stream| stream.kind == kind) {
            keyboard = keyboard.row(vec![button(stream)]);
        }
    }
    keyboard.row(vec![Button::new(
        "Cancel",
        CallbackAction::Cancel {
            correlation_id: bucket.correlation_id.clone(),
        },
    )])
}

pub fn selection_not_found() -> String {
    "Details not found. The selection expired, was cancelled or is already being processed."
        .to_string()
}

pub fn extracting(descriptor: &StreamDescriptor) -> String {
    format!(
        "Extracting {} stream {} from {}...",
        descriptor.kind,
        descriptor.label(),
        descriptor.source_name
    )
}

pub fn extraction_failed(descriptor: &StreamDescriptor, error: &ExtractError) -> String {
    if error.is_source_missing() {
        format!(
            "Extraction failed: {} is no longer on the server. Send the file again.",
            descriptor.source_name
        )
    } else if error.is_timeout() {
        format!(
            "Extraction of {} from {} timed out. Pick another stream or cancel.",
            descriptor.label(),
            descriptor.source_name
        )
    } else {
        format!(
            "Extraction of {} from {} failed. Pick another stream or cancel.",
            descriptor.label(),
            descriptor.source_name
        )
    }
}

pub fn uploading(descriptor: &StreamDescriptor) -> String {
    format!("Uploading extracted {} stream {}...", descriptor.kind, descriptor.label())
}

pub fn upload_failed(descriptor: &StreamDescriptor, error: &UploadError) -> String {
    match error {
        UploadError::Progress(_) => format!(
            "Upload of {} is blocked by another transfer for {}. Try again shortly.",
            descriptor.label(),
            descriptor.source_name
        ),
        _ => format!(
            "Upload of {} from {} failed. Pick a stream to try again or cancel.",
            descriptor.label(),
            descriptor.source_name
        ),
    }
}

pub fn upload_caption(descriptor: &StreamDescriptor) -> String {
    format!(
        "{} ({} {})",
        descriptor.source_name,
        descriptor.kind,
        descriptor.label()
    )
}

pub fn completed(descriptor: &StreamDescriptor) -> String {
    format!(
        "Done: {} from {} was sent.",
        descriptor.label(),
        descriptor.source_name
    )
}

pub fn cancelled(file_name: &str) -> String {
    format!("Cancelled. {file_name} was removed from the server.")
}

pub fn cancel_deferred() -> String {
    "Cancelling once the current step finishes.".to_string()
}

pub fn selection_expired(file_name: &str) -> String {
    format!("The selection for {file_name} expired and the file was removed.")
}

pub fn progress_pending() -> String {
    "Processing your file...".to_string()
}

pub fn already_started() -> String {
    "This file is already being processed.".to_string()
}

pub fn request_expired() -> String {
    "This request is no longer available.".to_string()
}

pub fn not_your_request() -> String {
    "Only the user who sent this file can use these buttons.".to_string()
}

pub fn unknown_action() -> String {
    "Unknown action.".to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use std::time::Duration;

    use super::*;
    use crate::ids::UserId;
    use crate::media::ToolError;
    use crate::progress::ProgressError;
    use crate::storage::StorageError;

    fn stream(index: u32, kind: StreamKind, language: &str, codec: &str) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind,
            codec_name: codec.to_string(),
            language: language.to_string(),
            source_path: PathBuf::from("/w/movie.mkv"),
            source_name: "movie.mkv".to_string(),
            requester_id: UserId::new(1),
            requester_name: "Ada".to_string(),
        }
    }

    #[test]
    fn test_selection_keyboard_layout() {
        let bucket = SelectionBucket::new(
            CorrelationId::new("1-2"),
            PathBuf::from("/w/movie.mkv"),
            "movie.mkv",
            vec![
                stream(2, StreamKind::Subtitle, "spa", "subrip"),
                stream(1, StreamKind::Audio, "eng", "aac"),
            ],
        );

        let keyboard = selection_keyboard(&bucket);
        let labels: Vec<&str> = keyboard.buttons().map(|b| b.label.as_str()).collect();

        assert_eq!(labels, vec!["Audio: ENG - aac", "Subtitle: SPA - subrip", "Cancel"]);
        assert_eq!(
            keyboard.rows()[0][0].action.encode(),
            "select:1:1-2"
        );
    }

    fn timeout() -> ToolError {
        ToolError::Timeout {
            program: PathBuf::from("ffmpeg"),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_failure_messages_are_distinct() {
        let descriptor = stream(1, StreamKind::Audio, "eng", "aac");
        let texts = [
            admission_rejected(
                "movie.mkv",
                &AdmissionRejection::GlobalCapacityExceeded { capacity: 10 },
            ),
            admission_rejected(
                "movie.mkv",
                &AdmissionRejection::LowDiskSpace {
                    available: 1,
                    required: 2,
                },
            ),
            transfer_failed(
                "movie.mkv",
                &TransferError::RetriesExhausted {
                    file_name: "movie.mkv".to_string(),
                    attempts: 5,
                    last: String::new(),
                },
            ),
            probe_failed(
                "movie.mkv",
                &ProbeError::Failed {
                    status: Some(1),
                    stderr: String::new(),
                },
            ),
            probe_failed("movie.mkv", &ProbeError::Tool(timeout())),
            no_streams("movie.mkv"),
            selection_not_found(),
            extraction_failed(
                &descriptor,
                &ExtractError::Failed {
                    status: Some(1),
                    stderr: String::new(),
                },
            ),
            extraction_failed(&descriptor, &ExtractError::Tool(timeout())),
            transfer_failed(
                "movie.mkv",
                &TransferError::Storage(StorageError::NoMountPoint {
                    path: PathBuf::from("/w"),
                }),
            ),
            extraction_failed(
                &descriptor,
                &ExtractError::SourceMissing {
                    path: PathBuf::from("/w/movie.mkv"),
                },
            ),
            transfer_failed(
                "movie.mkv",
                &TransferError::Progress(ProgressError::AlreadyActive {
                    correlation_id: CorrelationId::new("1-10"),
                }),
            ),
        ];

        for (i, a) in texts.iter().enumerate() {
            for b in texts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert!(texts[2].contains("after 5 attempts"));
        assert!(texts[4].contains("timed out"));
        assert!(texts[8].contains("timed out"));
        assert!(texts[9].contains("server storage is unavailable"));
        assert!(texts[11].contains("still running"));
    }

    #[test]
    fn test_invalid_media_names_file() {
        assert!(invalid_media("doc.pdf", Some("application/pdf")).contains("doc.pdf is application/pdf"));
    }
}
