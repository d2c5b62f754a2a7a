//! Drives pipelines from inbound file to delivered stream.
//!
//! The coordinator owns every registry and engine. Inbound events (files and
//! button presses) are handled inline; long-running stages are spawned on the
//! [`TaskSupervisor`] and report back by editing the pipeline's prompt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::messages;
use super::state::{PipelineEvent, PipelineState, PipelineStates};
use super::supervisor::{ShutdownReport, TaskSupervisor};
use crate::TributaryError;
use crate::admission::{AdmissionController, SlotGuard};
use crate::config::TributaryConfig;
use crate::ids::{ChatId, CorrelationId, MessageRef, Requester};
use crate::media::{
    ExtractionEngine, MetadataReader, StreamDescriptor, StreamProber, ToolRunner,
};
use crate::progress::ProgressRegistry;
use crate::selection::{
    CancelOutcome, ReleaseOutcome, SelectionBucket, SelectionError, SelectionStore,
};
use crate::status::{HostMetrics, StatusReporter, status_keyboard};
use crate::storage::{DiskSpaceProbe, WorkDir, remove_file_quietly};
use crate::transfer::TransferEngine;
use crate::transport::{
    CallbackAction, CallbackQuery, InboundFile, Keyboard, MessagingTransport, TransportError,
};
use crate::upload::{AuditOutcome, UploadEngine, UploadRequest};

/// External seams a coordinator runs against.
#[derive(Clone)]
pub struct PipelineServices {
    pub transport: Arc<dyn MessagingTransport>,
    pub tools: Arc<dyn ToolRunner>,
    pub disk: Arc<dyn DiskSpaceProbe>,
    pub metrics: Arc<dyn HostMetrics>,
}

/// What the coordinator remembers about one accepted file.
#[derive(Debug, Clone)]
struct PipelineRequest {
    file: InboundFile,
    requester: Requester,
    /// Bot message the pipeline reports into
    prompt: MessageRef,
}

/// Owner of all pipelines.
pub struct PipelineCoordinator {
    config: TributaryConfig,
    transport: Arc<dyn MessagingTransport>,
    admission: AdmissionController,
    progress: ProgressRegistry,
    selections: SelectionStore,
    states: PipelineStates,
    transfer: TransferEngine,
    prober: StreamProber,
    extractor: ExtractionEngine,
    uploader: UploadEngine,
    status: StatusReporter,
    work_dir: WorkDir,
    requests: Mutex<HashMap<CorrelationId, PipelineRequest>>,
    supervisor: TaskSupervisor,
}

impl PipelineCoordinator {
    /// Wires a coordinator over an already prepared working directory.
    pub fn new(config: TributaryConfig, services: PipelineServices, work_dir: WorkDir) -> Arc<Self> {
        let progress = ProgressRegistry::new();
        let admission = AdmissionController::new(
            config.admission.clone(),
            work_dir.root(),
            services.disk.clone(),
        );
        let transfer = TransferEngine::new(
            services.transport.clone(),
            progress.clone(),
            work_dir.clone(),
            config.transfer.clone(),
        );
        let prober = StreamProber::new(services.tools.clone(), &config.media);
        let extractor = ExtractionEngine::new(services.tools.clone(), &config.media);
        let uploader = UploadEngine::new(
            services.transport.clone(),
            progress.clone(),
            MetadataReader::new(services.tools.clone(), &config.media),
            config.audit.clone(),
            config.transfer.progress_interval,
        );
        let status = StatusReporter::new(progress.clone(), admission.clone(), services.metrics);

        Arc::new(Self {
            config,
            transport: services.transport,
            admission,
            progress,
            selections: SelectionStore::new(),
            states: PipelineStates::new(),
            transfer,
            prober,
            extractor,
            uploader,
            status,
            work_dir,
            requests: Mutex::new(HashMap::new()),
            supervisor: TaskSupervisor::new(),
        })
    }

    /// Prepares the working directory, builds the coordinator and starts the
    /// selection janitor.
    ///
    /// # Errors
    ///
    /// - `TributaryError::WorkDirUnavailable` - Working directory cannot be created
    pub async fn start(
        config: TributaryConfig,
        services: PipelineServices,
    ) -> crate::Result<Arc<Self>> {
        let root = config.storage.work_dir.clone();
        let work_dir = WorkDir::prepare(root.clone())
            .await
            .map_err(|source| TributaryError::WorkDirUnavailable { path: root, source })?;

        let coordinator = Self::new(config, services, work_dir);
        coordinator.spawn_janitor();
        tracing::info!(
            "Pipeline coordinator started in {}",
            coordinator.work_dir.root().display()
        );
        Ok(coordinator)
    }

    /// Accepts a file sent by `requester` and asks for confirmation.
    ///
    /// Returns the pipeline's correlation id, or `None` when the file was
    /// ignored (unauthorised sender) or refused (not a video).
    ///
    /// # Errors
    ///
    /// - `TributaryError::State` - A pipeline for this message already exists
    /// - `TributaryError::Transport` - Reply could not be sent
    pub async fn handle_inbound_file(
        &self,
        requester: Requester,
        file: InboundFile,
    ) -> crate::Result<Option<CorrelationId>> {
        if !self.config.access.allows(requester.id) {
            tracing::debug!(
                "Ignoring {} from unauthorised user {}",
                file.file_name,
                requester.id
            );
            return Ok(None);
        }

        let chat = file.message.chat;
        let mime = media_type(&file);
        if !mime.as_deref().is_some_and(|mime| mime.starts_with("video/")) {
            tracing::info!("Refusing {} ({:?}) from {}", file.file_name, mime, requester.id);
            self.transport
                .send_message(
                    chat,
                    &messages::invalid_media(&file.file_name, mime.as_deref()),
                    None,
                    Some(file.message.message),
                )
                .await?;
            return Ok(None);
        }

        let correlation_id = CorrelationId::from_message(file.message);
        self.states.start(&correlation_id)?;

        let prompt = match self
            .transport
            .send_message(
                chat,
                &messages::confirmation_prompt(&file),
                Some(&messages::confirmation_keyboard(&correlation_id)),
                Some(file.message.message),
            )
            .await
        {
            Ok(prompt) => prompt,
            Err(e) => {
                self.states.remove(&correlation_id);
                return Err(e.into());
            }
        };

        tracing::info!(
            correlation = %correlation_id,
            "Accepted {} ({} bytes) from {}",
            file.file_name,
            file.declared_size,
            requester.id
        );
        self.requests.lock().insert(
            correlation_id.clone(),
            PipelineRequest {
                file,
                requester,
                prompt,
            },
        );
        Ok(Some(correlation_id))
    }

    /// Handles a button press.
    pub async fn handle_callback(self: &Arc<Self>, query: CallbackQuery) {
        let action = match CallbackAction::decode(&query.payload) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!("Undecodable callback from {}: {}", query.from.id, e);
                self.answer(&query, &messages::unknown_action(), false).await;
                return;
            }
        };

        let Some(correlation_id) = action.correlation_id().cloned() else {
            // Close is the only action without a pipeline
            if let Err(e) = self.transport.delete_message(query.message).await {
                tracing::debug!("Could not delete {}: {}", query.message, e);
            }
            self.answer(&query, "", false).await;
            return;
        };

        let Some(request) = self.request(&correlation_id) else {
            let text = match action {
                CallbackAction::Select { .. } | CallbackAction::Cancel { .. } => {
                    messages::selection_not_found()
                }
                _ => messages::request_expired(),
            };
            self.answer(&query, &text, true).await;
            return;
        };
        if request.requester.id != query.from.id {
            self.answer(&query, &messages::not_your_request(), true).await;
            return;
        }

        match action {
            CallbackAction::Proceed { .. } => self.proceed(&query, correlation_id, request).await,
            CallbackAction::Dismiss { .. } => self.dismiss(&query, &correlation_id, &request).await,
            CallbackAction::ShowProgress { .. } => {
                let text = self.progress_text(&correlation_id);
                self.answer(&query, &text, true).await;
            }
            CallbackAction::Select { index, .. } => {
                self.select(&query, correlation_id, index, &request).await
            }
            CallbackAction::Cancel { .. } => {
                self.cancel(&query, &correlation_id, &request).await
            }
            CallbackAction::Close => {}
        }
    }

    /// Sends the status report to `chat` and keeps it current.
    ///
    /// # Errors
    ///
    /// - `TransportError` - Status message could not be sent
    pub async fn handle_status_command(&self, chat: ChatId) -> Result<MessageRef, TransportError> {
        let text = self.status.render().await;
        let message = self
            .transport
            .send_message(chat, &text, Some(&status_keyboard()), None)
            .await?;

        let status = self.status.clone();
        let transport = self.transport.clone();
        let config = self.config.status.clone();
        let shutdown = self.supervisor.shutdown_signal();
        self.supervisor.spawn("status", async move {
            status.watch(transport, message, config, shutdown).await;
        });
        Ok(message)
    }

    /// Progress summary for the "Check progress" button.
    pub fn progress_text(&self, correlation_id: &CorrelationId) -> String {
        self.progress
            .record_for_correlation(correlation_id)
            .map(|record| record.summary())
            .unwrap_or_else(messages::progress_pending)
    }

    /// Removes open selections older than the configured TTL together with
    /// their files. Returns how many were purged.
    pub async fn purge_expired_selections(&self) -> usize {
        let expired = self.selections.purge_expired(self.config.storage.selection_ttl);
        for bucket in &expired {
            let correlation_id = &bucket.correlation_id;
            tracing::info!(correlation = %correlation_id, "Selection for {} expired", bucket.source_name);
            self.states.remove(correlation_id);
            let request = self.requests.lock().remove(correlation_id);
            self.work_dir.remove_transfer_dir(correlation_id).await;
            if let Some(request) = request {
                self.notify(
                    request.prompt,
                    &messages::selection_expired(&bucket.source_name),
                    None,
                )
                .await;
            }
        }
        expired.len()
    }

    pub fn state(&self, correlation_id: &CorrelationId) -> Option<PipelineState> {
        self.states.get(correlation_id)
    }

    /// Live state or the outcome of a recently finished pipeline.
    pub fn outcome(&self, correlation_id: &CorrelationId) -> Option<PipelineState> {
        self.states.outcome(correlation_id)
    }

    /// Waits for the pipeline to reach a state matching `predicate`.
    pub async fn wait_until<F>(
        &self,
        correlation_id: &CorrelationId,
        timeout: Duration,
        predicate: F,
    ) -> Option<PipelineState>
    where
        F: Fn(PipelineState) -> bool,
    {
        self.states.wait_until(correlation_id, timeout, predicate).await
    }

    /// Streams currently offered for `correlation_id`.
    pub fn selection(&self, correlation_id: &CorrelationId) -> Option<SelectionBucket> {
        self.selections.snapshot(correlation_id)
    }

    /// Prompt message of a live pipeline.
    pub fn prompt(&self, correlation_id: &CorrelationId) -> Option<MessageRef> {
        self.request(correlation_id).map(|request| request.prompt)
    }

    pub async fn status_report(&self) -> String {
        self.status.render().await
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    pub fn transfer_dir(&self, correlation_id: &CorrelationId) -> std::path::PathBuf {
        self.work_dir.transfer_dir(correlation_id)
    }

    /// Stops accepting work, lets running stages finish within `grace`, then
    /// aborts the rest.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        tracing::info!("Shutting down with {} live pipelines", self.states.active_count());
        self.supervisor.shutdown(grace).await
    }

    async fn proceed(
        self: &Arc<Self>,
        query: &CallbackQuery,
        correlation_id: CorrelationId,
        request: PipelineRequest,
    ) {
        let file_name = request.file.file_name.clone();
        let slot = match self.admission.acquire(query.from.id, &correlation_id).await {
            Ok(slot) => slot,
            Err(rejection) => {
                if self
                    .apply(&correlation_id, PipelineEvent::AdmissionRejected)
                    .is_none()
                {
                    self.answer(query, &messages::already_started(), false).await;
                    return;
                }
                tracing::info!(correlation = %correlation_id, "Admission rejected: {}", rejection);
                self.requests.lock().remove(&correlation_id);
                let text = messages::admission_rejected(&file_name, &rejection);
                self.notify(request.prompt, &text, None).await;
                self.answer(query, &text, true).await;
                return;
            }
        };

        if self.apply(&correlation_id, PipelineEvent::Proceed).is_none() {
            drop(slot);
            self.answer(query, &messages::already_started(), false).await;
            return;
        }

        self.answer(query, "", false).await;
        self.notify(
            request.prompt,
            &messages::downloading(&file_name),
            Some(&messages::progress_keyboard(&correlation_id)),
        )
        .await;

        let coordinator = Arc::clone(self);
        self.supervisor.spawn("transfer", async move {
            coordinator.run_transfer_stage(correlation_id, slot).await;
        });
    }

    async fn dismiss(
        &self,
        query: &CallbackQuery,
        correlation_id: &CorrelationId,
        request: &PipelineRequest,
    ) {
        if self.apply(correlation_id, PipelineEvent::Cancel).is_none() {
            self.answer(query, &messages::already_started(), false).await;
            return;
        }
        self.requests.lock().remove(correlation_id);
        if let Err(e) = self.transport.delete_message(request.prompt).await {
            tracing::debug!("Could not delete prompt {}: {}", request.prompt, e);
        }
        self.answer(query, &messages::cancelled(&request.file.file_name), false)
            .await;
    }

    async fn select(
        self: &Arc<Self>,
        query: &CallbackQuery,
        correlation_id: CorrelationId,
        index: u32,
        request: &PipelineRequest,
    ) {
        let descriptor = match self.selections.claim(&correlation_id, index) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::debug!(correlation = %correlation_id, "Selection refused: {}", e);
                // A lost race leaves the state alone
                if matches!(e, SelectionError::UnknownStream { .. }) {
                    self.apply(&correlation_id, PipelineEvent::SelectionMissing);
                }
                self.answer(query, &messages::selection_not_found(), true).await;
                return;
            }
        };

        if self
            .apply(&correlation_id, PipelineEvent::StreamSelected { index })
            .is_none()
        {
            self.selections.release(&correlation_id);
            self.answer(query, &messages::selection_not_found(), true).await;
            return;
        }

        self.answer(query, "", false).await;
        self.notify(request.prompt, &messages::extracting(&descriptor), None)
            .await;

        let coordinator = Arc::clone(self);
        self.supervisor.spawn("extraction", async move {
            coordinator.run_extraction_stage(correlation_id, descriptor).await;
        });
    }

    async fn cancel(
        &self,
        query: &CallbackQuery,
        correlation_id: &CorrelationId,
        request: &PipelineRequest,
    ) {
        match self.selections.cancel(correlation_id) {
            CancelOutcome::Removed(_) => {
                self.finish_cancel(correlation_id, request).await;
                self.answer(query, &messages::cancelled(&request.file.file_name), false)
                    .await;
            }
            CancelOutcome::Deferred => {
                self.answer(query, &messages::cancel_deferred(), true).await;
            }
            CancelOutcome::NotFound => {
                self.answer(query, &messages::selection_not_found(), true).await;
            }
        }
    }

    async fn run_transfer_stage(self: Arc<Self>, correlation_id: CorrelationId, slot: SlotGuard) {
        let Some(request) = self.request(&correlation_id) else {
            return;
        };
        let file_name = request.file.file_name.clone();

        let downloaded = self
            .transfer
            .download(&correlation_id, &request.file, request.prompt)
            .await;
        drop(slot);

        let source = match downloaded {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(correlation = %correlation_id, "Download of {} failed: {}", file_name, e);
                self.conclude(
                    &correlation_id,
                    request.prompt,
                    &messages::transfer_failed(&file_name, &e),
                    PipelineEvent::TransferFailed,
                )
                .await;
                return;
            }
        };

        self.send_source_audit(&request).await;
        self.notify(request.prompt, &messages::probing(&file_name), None)
            .await;

        let streams = match self
            .prober
            .probe(&source, &request.requester, &file_name)
            .await
        {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(correlation = %correlation_id, "Probing {} failed: {}", file_name, e);
                self.conclude(
                    &correlation_id,
                    request.prompt,
                    &messages::probe_failed(&file_name, &e),
                    PipelineEvent::ProbeFailed,
                )
                .await;
                return;
            }
        };

        if streams.is_empty() {
            self.conclude(
                &correlation_id,
                request.prompt,
                &messages::no_streams(&file_name),
                PipelineEvent::NoStreams,
            )
            .await;
            return;
        }

        let bucket = SelectionBucket::new(correlation_id.clone(), source, &file_name, streams);
        let text = messages::selection_prompt(&bucket);
        let keyboard = messages::selection_keyboard(&bucket);
        if let Err(e) = self.selections.insert(bucket) {
            tracing::error!(correlation = %correlation_id, "Cannot offer streams: {}", e);
            self.conclude(
                &correlation_id,
                request.prompt,
                &messages::selection_unavailable(&file_name),
                PipelineEvent::ProbeFailed,
            )
            .await;
            return;
        }
        // Buttons only appear once the state accepts a selection
        self.apply(&correlation_id, PipelineEvent::StreamsReady);
        self.notify(request.prompt, &text, Some(&keyboard)).await;
    }

    async fn run_extraction_stage(
        self: Arc<Self>,
        correlation_id: CorrelationId,
        descriptor: StreamDescriptor,
    ) {
        let Some(request) = self.request(&correlation_id) else {
            return;
        };

        let output = match self.extractor.extract(&descriptor).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    correlation = %correlation_id,
                    "Extracting stream {} of {} failed: {}",
                    descriptor.index,
                    descriptor.source_name,
                    e
                );
                let text = messages::extraction_failed(&descriptor, &e);
                let source_missing = e.is_source_missing();
                let event = PipelineEvent::ExtractionFailed { source_missing };
                if source_missing {
                    self.conclude(&correlation_id, request.prompt, &text, event)
                        .await;
                } else {
                    self.reopen(&correlation_id, &request, &text, event).await;
                }
                return;
            }
        };

        if self.selections.cancel_requested(&correlation_id) {
            remove_file_quietly(&output).await;
            self.finish_cancel(&correlation_id, &request).await;
            return;
        }

        self.notify(request.prompt, &messages::uploading(&descriptor), None)
            .await;
        self.apply(&correlation_id, PipelineEvent::ExtractionSucceeded);

        let upload = UploadRequest {
            correlation_id: correlation_id.clone(),
            artifact: output,
            kind: descriptor.kind,
            chat: request.file.message.chat,
            reply_to: Some(request.file.message.message),
            status_message: request.prompt,
            requester: request.requester.clone(),
            caption: messages::upload_caption(&descriptor),
        };

        match self.uploader.upload(upload).await {
            Ok(receipt) => {
                if let AuditOutcome::Failed(e) = &receipt.audit {
                    tracing::warn!(correlation = %correlation_id, "{}", e);
                }
                self.conclude(
                    &correlation_id,
                    request.prompt,
                    &messages::completed(&descriptor),
                    PipelineEvent::UploadSucceeded,
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(correlation = %correlation_id, "Upload failed: {}", e);
                self.reopen(
                    &correlation_id,
                    &request,
                    &messages::upload_failed(&descriptor, &e),
                    PipelineEvent::UploadFailed,
                )
                .await;
            }
        }
    }

    /// Hands the bucket back after a failed stage and offers the streams
    /// again, unless a cancel arrived meanwhile.
    ///
    /// The bucket is reopened before the failure is recorded, so anyone
    /// observing the failed state can select right away.
    async fn reopen(
        &self,
        correlation_id: &CorrelationId,
        request: &PipelineRequest,
        text: &str,
        failure: PipelineEvent,
    ) {
        match self.selections.release(correlation_id) {
            ReleaseOutcome::Reopened => {
                let keyboard = self
                    .selections
                    .snapshot(correlation_id)
                    .map(|bucket| messages::selection_keyboard(&bucket));
                self.notify(request.prompt, text, keyboard.as_ref()).await;
                self.apply(correlation_id, failure);
            }
            ReleaseOutcome::Cancelled(_) => {
                self.apply(correlation_id, failure);
                self.finish_cancel(correlation_id, request).await;
            }
            ReleaseOutcome::Missing => {
                self.discard(correlation_id).await;
                self.notify(request.prompt, text, None).await;
                self.apply(correlation_id, failure);
                self.states.remove(correlation_id);
            }
        }
    }

    async fn finish_cancel(&self, correlation_id: &CorrelationId, request: &PipelineRequest) {
        tracing::info!(correlation = %correlation_id, "Cancelled {}", request.file.file_name);
        self.conclude(
            correlation_id,
            request.prompt,
            &messages::cancelled(&request.file.file_name),
            PipelineEvent::Cancel,
        )
        .await;
    }

    /// Ends a pipeline: files go first, then the prompt, then the state, so
    /// a terminal state always means cleanup is done.
    async fn conclude(
        &self,
        correlation_id: &CorrelationId,
        prompt: MessageRef,
        text: &str,
        event: PipelineEvent,
    ) {
        self.discard(correlation_id).await;
        self.notify(prompt, text, None).await;
        self.apply(correlation_id, event);
    }

    /// Forgets a pipeline and deletes its files.
    async fn discard(&self, correlation_id: &CorrelationId) {
        self.selections.remove(correlation_id);
        self.requests.lock().remove(correlation_id);
        self.work_dir.remove_transfer_dir(correlation_id).await;
    }

    async fn send_source_audit(&self, request: &PipelineRequest) {
        let Some(chat) = self.config.audit.media_destination() else {
            return;
        };
        if !self.config.audit.pause.is_zero() {
            tokio::time::sleep(self.config.audit.pause).await;
        }

        let caption = messages::source_audit_caption(&request.file, &request.requester);
        if let Err(e) = self
            .transport
            .copy_message(chat, request.file.message, Some(&caption))
            .await
        {
            tracing::warn!(
                "Audit copy of {} to chat {} failed: {}",
                request.file.file_name,
                chat,
                e
            );
        }
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.storage.janitor_interval;
        let mut shutdown = self.supervisor.shutdown_signal();

        self.supervisor.spawn("janitor", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let purged = coordinator.purge_expired_selections().await;
                if purged > 0 {
                    tracing::info!("Purged {} expired selections", purged);
                }
            }
        });
    }

    fn request(&self, correlation_id: &CorrelationId) -> Option<PipelineRequest> {
        self.requests.lock().get(correlation_id).cloned()
    }

    /// Applies an event, logging instead of failing when it no longer fits.
    fn apply(&self, correlation_id: &CorrelationId, event: PipelineEvent) -> Option<PipelineState> {
        match self.states.apply(correlation_id, event) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(correlation = %correlation_id, "Ignoring {:?}: {}", event, e);
                None
            }
        }
    }

    async fn notify(&self, prompt: MessageRef, text: &str, keyboard: Option<&Keyboard>) {
        match self.transport.edit_message(prompt, text, keyboard).await {
            Ok(()) | Err(TransportError::NotModified) => {}
            Err(e) => tracing::warn!("Could not update {}: {}", prompt, e),
        }
    }

    async fn answer(&self, query: &CallbackQuery, text: &str, show_alert: bool) {
        if let Err(e) = self
            .transport
            .answer_callback(&query.id, text, show_alert)
            .await
        {
            tracing::debug!("Could not answer callback {}: {}", query.id, e);
        }
    }
}

/// Declared MIME type, or one guessed from the file name.
fn media_type(file: &InboundFile) -> Option<String> {
    file.mime_type.clone().or_else(|| {
        mime_guess::from_path(Path::new(&file.file_name))
            .first()
            .map(|mime| mime.essence_str().to_string())
    })
}
