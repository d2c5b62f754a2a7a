//! The status command and its periodically refreshed message.

use std::time::Duration;

use tributary_core::ChatId;
use tributary_core::transport::{CallbackAction, CallbackQuery, TransportError};

use crate::common::{CHAT, Harness, owner};

#[tokio::test]
async fn test_status_message_is_refreshed() {
    let harness = Harness::new();

    let message = harness
        .coordinator
        .handle_status_command(ChatId::new(CHAT))
        .await
        .unwrap();

    let sent = harness.transport.current(message).unwrap();
    assert!(sent.text.contains("No downloads in progress."));
    assert!(sent.text.contains("• Transfer slots: 0/10"));
    assert_eq!(sent.keyboard.unwrap().buttons().count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let edits = harness.transport.edits();
    assert!(!edits.is_empty());
    assert!(edits.iter().all(|edit| edit.message == message));
}

#[tokio::test]
async fn test_status_stops_when_message_gone() {
    let harness = Harness::with_config(|config| {
        config.status.watch_duration = Duration::from_secs(60)
    });
    harness.transport.script_edit_error(TransportError::MessageGone);

    harness
        .coordinator
        .handle_status_command(ChatId::new(CHAT))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.transport.edit_attempts(), 1);
    let report = harness.coordinator.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.aborted, 0);
}

#[tokio::test]
async fn test_shutdown_stops_status_updates() {
    let harness = Harness::with_config(|config| {
        config.status.watch_duration = Duration::from_secs(60)
    });
    harness
        .coordinator
        .handle_status_command(ChatId::new(CHAT))
        .await
        .unwrap();

    let report = harness.coordinator.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.aborted, 0);

    let attempts = harness.transport.edit_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.edit_attempts(), attempts);
}

#[tokio::test]
async fn test_close_button_deletes_status() {
    let harness = Harness::new();
    let message = harness
        .coordinator
        .handle_status_command(ChatId::new(CHAT))
        .await
        .unwrap();

    harness
        .coordinator
        .handle_callback(CallbackQuery {
            id: "close".to_string(),
            from: owner(),
            message,
            payload: CallbackAction::Close.encode(),
        })
        .await;

    assert_eq!(harness.transport.deleted(), vec![message]);
}
