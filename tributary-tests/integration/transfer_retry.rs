//! Download retries and their effect on the pipeline.

use tributary_core::pipeline::{FailureKind, PipelineState};
use tributary_core::testing::DownloadScript;
use tributary_core::transport::CallbackAction;

use crate::common::{Harness, WAIT};

#[tokio::test]
async fn test_persistent_mismatch_fails_pipeline() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.transport.script_download(DownloadScript::Short(100));
    }

    let id = harness.submit(10, "movie.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.finished(&id).await,
        Some(PipelineState::Failed(FailureKind::TransferFailed))
    );
    assert_eq!(harness.transport.download_attempts(), 3);
    assert_eq!(
        harness.prompt_text(&id),
        "Failed to download movie.mkv after 3 attempts."
    );
    assert!(!harness.coordinator.transfer_dir(&id).exists());
    assert_eq!(harness.coordinator.progress().active_count(), 0);
    assert_eq!(harness.coordinator.admission().active_slots(), 0);
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let harness = Harness::new();
    harness
        .transport
        .script_download(DownloadScript::Fail("connection reset".to_string()));
    harness.transport.script_download(DownloadScript::Short(1));

    let id = harness.staged(10, "movie.mkv").await;

    assert_eq!(harness.transport.download_attempts(), 3);
    let bucket = harness.coordinator.selection(&id).unwrap();
    assert_eq!(std::fs::metadata(&bucket.source_path).unwrap().len(), 4096);
    let leftovers: Vec<_> = std::fs::read_dir(harness.coordinator.transfer_dir(&id))
        .unwrap()
        .collect();
    assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn test_progress_button_reports_pending_or_summary() {
    let harness = Harness::new();
    let id = harness.submit(10, "movie.mkv").await;

    harness
        .press(CallbackAction::ShowProgress {
            correlation_id: id.clone(),
        })
        .await;
    assert_eq!(harness.answers(), vec!["Processing your file...".to_string()]);

    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;
    harness
        .coordinator
        .wait_until(&id, WAIT, |s| s == PipelineState::AwaitingSelection)
        .await
        .unwrap();
    // Finished transfers leave no record behind
    assert_eq!(
        harness.coordinator.progress_text(&id),
        "Processing your file..."
    );
}
