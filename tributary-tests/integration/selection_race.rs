//! Concurrent presses on the same selection.

use std::time::Duration;

use tributary_core::pipeline::{FailureKind, PipelineState};
use tributary_core::transport::CallbackAction;

use crate::common::{Harness, WAIT};

fn select(id: &tributary_core::CorrelationId, index: u32) -> CallbackAction {
    CallbackAction::Select {
        correlation_id: id.clone(),
        index,
    }
}

#[tokio::test]
async fn test_double_press_extracts_once() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;
    harness.runner.set_extraction_delay(Duration::from_millis(100));

    futures::future::join(harness.press(select(&id, 1)), harness.press(select(&id, 2))).await;

    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
    assert_eq!(harness.runner.extraction_count(), 1);
    assert_eq!(harness.transport.sent_files().len(), 1);

    let refused = harness
        .answers()
        .iter()
        .filter(|text| text.starts_with("Details not found"))
        .count();
    assert_eq!(refused, 1);
}

#[tokio::test]
async fn test_cancel_during_extraction_is_deferred() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;
    harness.runner.set_extraction_delay(Duration::from_millis(200));

    harness.press(select(&id, 1)).await;
    assert_eq!(
        harness.coordinator.state(&id),
        Some(PipelineState::Extracting { index: 1 })
    );
    harness
        .press(CallbackAction::Cancel {
            correlation_id: id.clone(),
        })
        .await;
    assert_eq!(
        harness.answers().last().map(String::as_str),
        Some("Cancelling once the current step finishes.")
    );

    assert_eq!(harness.finished(&id).await, Some(PipelineState::Cancelled));
    assert_eq!(harness.runner.extraction_count(), 1);
    assert!(harness.transport.sent_files().is_empty());
    assert!(!harness.coordinator.transfer_dir(&id).exists());
    assert!(harness.coordinator.selection(&id).is_none());
}

#[tokio::test]
async fn test_unknown_stream_can_be_retried() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;

    harness.press(select(&id, 9)).await;
    assert_eq!(
        harness.coordinator.state(&id),
        Some(PipelineState::Failed(FailureKind::SelectionNotFound))
    );
    assert_eq!(harness.runner.extraction_count(), 0);

    harness.press(select(&id, 2)).await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
}

#[tokio::test]
async fn test_extraction_failure_reopens_selection() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;
    harness.runner.fail_extraction("Conversion failed!");

    harness.press(select(&id, 1)).await;
    let state = harness
        .coordinator
        .wait_until(&id, WAIT, |s| {
            s == PipelineState::Failed(FailureKind::ExtractionFailed)
        })
        .await;
    assert!(state.is_some());
    assert!(
        harness
            .prompt_text(&id)
            .starts_with("Extraction of ENG - aac from movie.mkv failed")
    );

    harness.runner.heal_extraction();
    harness.press(select(&id, 1)).await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
    assert_eq!(harness.runner.extraction_count(), 2);
}

#[tokio::test]
async fn test_extraction_timeout_reopens_selection() {
    let harness = Harness::new();
    let id = harness.staged(10, "movie.mkv").await;
    harness.runner.time_out_extraction();

    harness.press(select(&id, 2)).await;
    let state = harness
        .coordinator
        .wait_until(&id, WAIT, |s| {
            s == PipelineState::Failed(FailureKind::ExtractionFailed)
        })
        .await;
    assert!(state.is_some());
    assert!(
        harness
            .prompt_text(&id)
            .starts_with("Extraction of SPA - subrip from movie.mkv timed out")
    );
    assert!(harness.coordinator.selection(&id).is_some());
    assert!(harness.transport.sent_files().is_empty());

    harness.runner.heal_extraction();
    harness.press(select(&id, 2)).await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
    assert_eq!(harness.runner.extraction_count(), 2);
}

#[tokio::test]
async fn test_select_as_soon_as_buttons_appear() {
    let harness = Harness::new();
    let id = harness.submit(10, "movie.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    let offered = |harness: &Harness| {
        harness.transport.edits().iter().any(|edit| {
            edit.keyboard.as_ref().is_some_and(|keyboard| {
                keyboard
                    .buttons()
                    .any(|button| button.action == select(&id, 1))
            })
        })
    };
    let deadline = tokio::time::Instant::now() + WAIT;
    while !offered(&harness) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::task::yield_now().await;
    }

    harness.press(select(&id, 1)).await;
    assert_eq!(harness.finished(&id).await, Some(PipelineState::Succeeded));
    assert_eq!(harness.runner.extraction_count(), 1);
}
