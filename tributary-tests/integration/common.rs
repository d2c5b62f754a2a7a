//! Shared fixture for driving a coordinator with scripted seams.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tributary_core::pipeline::{PipelineCoordinator, PipelineServices, PipelineState};
use tributary_core::storage::WorkDir;
use tributary_core::testing::{
    FixedDiskSpace, ScriptedToolRunner, ScriptedTransport, StaticHostMetrics,
};
use tributary_core::transport::{CallbackAction, CallbackQuery, InboundFile};
use tributary_core::{ChatId, CorrelationId, MessageId, MessageRef, Requester, TributaryConfig, UserId};

pub const OWNER: i64 = 7;
pub const CHAT: i64 = 1;
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub temp_dir: TempDir,
    pub transport: Arc<ScriptedTransport>,
    pub runner: Arc<ScriptedToolRunner>,
    pub coordinator: Arc<PipelineCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness from the test configuration after `adjust` ran on it.
    pub fn with_config(adjust: impl FnOnce(&mut TributaryConfig)) -> Self {
        Self::with_disk(FixedDiskSpace::new(u64::MAX), adjust)
    }

    pub fn with_disk(disk: FixedDiskSpace, adjust: impl FnOnce(&mut TributaryConfig)) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = TributaryConfig::for_testing();
        config.access.owner = Some(UserId::new(OWNER));
        config.storage.work_dir = temp_dir.path().to_path_buf();
        adjust(&mut config);

        let transport = Arc::new(ScriptedTransport::new());
        let runner = Arc::new(ScriptedToolRunner::new());
        let services = PipelineServices {
            transport: transport.clone(),
            tools: runner.clone(),
            disk: Arc::new(disk),
            metrics: Arc::new(StaticHostMetrics::default()),
        };
        let coordinator =
            PipelineCoordinator::new(config, services, WorkDir::new(temp_dir.path()));

        Self {
            temp_dir,
            transport,
            runner,
            coordinator,
        }
    }

    /// Submits a video sent as message `message_id`.
    pub async fn submit(&self, message_id: i64, name: &str) -> CorrelationId {
        self.coordinator
            .handle_inbound_file(owner(), inbound(message_id, name, 4096))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn press(&self, action: CallbackAction) {
        self.coordinator.handle_callback(query(owner(), action)).await;
    }

    /// Submits and confirms a file, then waits for the stream choice.
    pub async fn staged(&self, message_id: i64, name: &str) -> CorrelationId {
        let id = self.submit(message_id, name).await;
        self.press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;
        let state = self
            .coordinator
            .wait_until(&id, WAIT, |s| s == PipelineState::AwaitingSelection)
            .await;
        assert_eq!(state, Some(PipelineState::AwaitingSelection));
        self.wait_for_prompt(&id, "Select the stream to extract").await;
        id
    }

    pub async fn finished(&self, id: &CorrelationId) -> Option<PipelineState> {
        self.coordinator.wait_until(id, WAIT, |s| s.is_terminal()).await
    }

    /// Text currently shown in the pipeline's prompt.
    pub fn prompt_text(&self, id: &CorrelationId) -> String {
        let sent = self.transport.sent_messages();
        let prompt = sent
            .iter()
            .find(|shown| {
                shown.keyboard.as_ref().is_some_and(|keyboard| {
                    keyboard
                        .buttons()
                        .any(|button| button.action.correlation_id() == Some(id))
                })
            })
            .map(|shown| shown.message)
            .unwrap();
        self.transport.current(prompt).unwrap().text
    }

    /// Waits until the prompt shows `needle` and returns its text.
    pub async fn wait_for_prompt(&self, id: &CorrelationId, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let text = self.prompt_text(id);
            if text.contains(needle) || tokio::time::Instant::now() >= deadline {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Texts of every callback answer so far.
    pub fn answers(&self) -> Vec<String> {
        self.transport
            .answers()
            .into_iter()
            .map(|answer| answer.text)
            .collect()
    }
}

pub fn owner() -> Requester {
    Requester::new(UserId::new(OWNER), "Ada").with_username("ada")
}

pub fn inbound(message_id: i64, name: &str, size: u64) -> InboundFile {
    InboundFile {
        file_id: format!("file-{message_id}"),
        file_name: name.to_string(),
        declared_size: size,
        mime_type: None,
        message: MessageRef::new(ChatId::new(CHAT), MessageId::new(message_id)),
    }
}

pub fn query(from: Requester, action: CallbackAction) -> CallbackQuery {
    CallbackQuery {
        id: format!("q-{}", action.encode()),
        from,
        message: MessageRef::new(ChatId::new(CHAT), MessageId::new(1)),
        payload: action.encode(),
    }
}
