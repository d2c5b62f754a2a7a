//! End-to-end pipeline runs from inbound file to delivered stream.

use tributary_core::ChatId;
use tributary_core::media::StreamKind;
use tributary_core::pipeline::{FailureKind, PipelineState};
use tributary_core::transport::{CallbackAction, OutboundKind};

use crate::common::{CHAT, Harness};

#[tokio::test]
async fn test_probe_offers_audio_and_subtitle() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;

    let bucket = harness.coordinator.selection(&id).unwrap();
    let streams: Vec<(u32, StreamKind, String)> = bucket
        .streams()
        .map(|s| (s.index, s.kind, s.language.clone()))
        .collect();
    assert_eq!(
        streams,
        vec![
            (1, StreamKind::Audio, "eng".to_string()),
            (2, StreamKind::Subtitle, "spa".to_string()),
        ]
    );
    assert!(harness.prompt_text(&id).contains("Select the stream to extract (2 available)"));
}

#[tokio::test]
async fn test_subtitle_delivered_and_cleaned_up() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;

    harness
        .press(CallbackAction::Select {
            correlation_id: id.clone(),
            index: 2,
        })
        .await;

    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
    let sent = harness.transport.sent_files();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat, ChatId::new(CHAT));
    assert_eq!(sent[0].kind, OutboundKind::Document);
    assert!(sent[0].path.ends_with("movie.srt"));
    assert!(!sent[0].path.exists());
    assert!(!harness.coordinator.transfer_dir(&id).exists());
    assert!(harness.coordinator.selection(&id).is_none());
    assert_eq!(
        harness.prompt_text(&id),
        "Done: SPA - subrip from movie.mkv was sent."
    );
}

#[tokio::test]
async fn test_audit_copies() {
    let harness = Harness::with_config(|config| config.audit.chat = Some(ChatId::new(-100)));
    let id = harness.staged(10, "movie.mkv").await;

    let copies = harness.transport.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].to, ChatId::new(-100));
    assert!(copies[0].caption.as_deref().unwrap().contains("Requested by Ada (@ada, id 7)"));

    harness
        .press(CallbackAction::Select {
            correlation_id: id.clone(),
            index: 1,
        })
        .await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));

    let sent = harness.transport.sent_files();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0].kind, OutboundKind::Audio(meta) if meta.title.as_deref() == Some("Fixture")));
    assert_eq!(sent[1].chat, ChatId::new(-100));
}

#[tokio::test]
async fn test_upload_failure_keeps_source_for_retry() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;
    harness.transport.fail_uploads_to(ChatId::new(CHAT));

    harness
        .press(CallbackAction::Select {
            correlation_id: id.clone(),
            index: 1,
        })
        .await;
    let state = harness
        .coordinator
        .wait_until(&id, crate::common::WAIT, |s| {
            s == PipelineState::Failed(FailureKind::UploadFailed)
        })
        .await;
    assert!(state.is_some());

    let bucket = harness.coordinator.selection(&id).unwrap();
    assert!(bucket.source_path.exists());
    assert!(!bucket.source_path.with_extension("mp3").exists());
    assert!(harness.prompt_text(&id).starts_with("Upload of ENG - aac from movie.mkv failed"));

    harness.transport.heal_uploads();
    harness
        .press(CallbackAction::Select {
            correlation_id: id.clone(),
            index: 1,
        })
        .await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
}

#[tokio::test]
async fn test_video_without_streams() {
    let harness = Harness::new();
    harness
        .runner
        .set_probe_output(r#"{"streams":[{"index":0,"codec_type":"video","codec_name":"h264"}]}"#);

    let id = harness.submit(10, "silent.mp4").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.finished(&id).await,
        Some(PipelineState::Failed(FailureKind::NoStreams))
    );
    assert_eq!(
        harness.prompt_text(&id),
        "silent.mp4 has no audio or subtitle streams to extract."
    );
    assert!(!harness.coordinator.transfer_dir(&id).exists());
}

#[tokio::test]
async fn test_probe_failure_removes_source() {
    let harness = Harness::new();
    harness.runner.fail_probe("Invalid data found when processing input");

    let id = harness.submit(10, "broken.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.finished(&id).await,
        Some(PipelineState::Failed(FailureKind::ProbeFailed))
    );
    assert!(harness.prompt_text(&id).starts_with("Could not read the streams of broken.mkv"));
    assert!(!harness.coordinator.transfer_dir(&id).exists());
}

#[tokio::test]
async fn test_probe_timeout_is_reported() {
    let harness = Harness::new();
    harness.runner.time_out_probe();

    let id = harness.submit(10, "huge.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.finished(&id).await,
        Some(PipelineState::Failed(FailureKind::ProbeFailed))
    );
    assert_eq!(
        harness.prompt_text(&id),
        "Reading the streams of huge.mkv timed out. The file was removed."
    );
    assert!(!harness.coordinator.transfer_dir(&id).exists());
}

#[tokio::test]
async fn test_cancel_from_selection() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;

    harness
        .press(CallbackAction::Cancel {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(harness.coordinator.outcome(&id), Some(PipelineState::Cancelled));
    assert!(!harness.coordinator.transfer_dir(&id).exists());
    assert!(harness.transport.sent_files().is_empty());
}

#[tokio::test]
async fn test_expired_selection_is_not_found() {
    let harness = Harness::with_config(|config| {
        config.storage.selection_ttl = std::time::Duration::ZERO
    });
    let id = harness.staged(10, "movie.mkv").await;

    assert_eq!(harness.coordinator.purge_expired_selections().await, 1);
    assert!(!harness.coordinator.transfer_dir(&id).exists());
    assert!(harness.prompt_text(&id).contains("expired"));

    harness
        .press(CallbackAction::Select {
            correlation_id: id.clone(),
            index: 1,
        })
        .await;
    assert!(
        harness
            .answers()
            .last()
            .unwrap()
            .starts_with("Details not found")
    );
    assert_eq!(harness.runner.extraction_count(), 0);
}
