//! Scripted doubles for the pipeline's external seams.
//!
//! Available to unit tests and, through the `test-utils` feature, to the
//! integration test crate.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::ids::{ChatId, MessageId, MessageRef};
use crate::media::{ToolError, ToolInvocation, ToolOutput, ToolRunner};
use crate::progress::ProgressCallback;
use crate::status::{HostMetrics, HostSnapshot};
use crate::storage::{DiskSpaceProbe, StorageError};
use crate::transport::{
    InboundFile, Keyboard, MessagingTransport, OutboundFile, OutboundKind, TransportError,
    staging_path,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// ffprobe output for a file with one video, one English audio and one
/// Spanish subtitle stream.
pub fn fixture_probe_json() -> String {
    r#"{
  "streams": [
    {"index": 0, "codec_name": "h264", "codec_type": "video"},
    {"index": 1, "codec_name": "aac", "codec_type": "audio", "tags": {"language": "eng"}},
    {"index": 2, "codec_name": "subrip", "codec_type": "subtitle", "tags": {"language": "spa"}}
  ]
}"#
    .to_string()
}

/// Disk probe reporting a fixed amount of free space.
#[derive(Debug, Clone)]
pub struct FixedDiskSpace {
    available: Option<u64>,
}

impl FixedDiskSpace {
    pub fn new(available: u64) -> Self {
        Self {
            available: Some(available),
        }
    }

    /// Probe whose every query fails.
    pub fn failing() -> Self {
        Self { available: None }
    }
}

impl DiskSpaceProbe for FixedDiskSpace {
    fn available_space(&self, path: &Path) -> Result<u64, StorageError> {
        self.available.ok_or_else(|| StorageError::NoMountPoint {
            path: path.to_path_buf(),
        })
    }
}

/// Host metrics that never change.
#[derive(Debug, Clone)]
pub struct StaticHostMetrics {
    pub snapshot: HostSnapshot,
}

impl Default for StaticHostMetrics {
    fn default() -> Self {
        Self {
            snapshot: HostSnapshot {
                disk_total: 100 * GIB,
                disk_used: 40 * GIB,
                disk_free: 60 * GIB,
                cpu_percent: 12.5,
                memory_percent: 48.0,
            },
        }
    }
}

impl HostMetrics for StaticHostMetrics {
    fn snapshot(&self) -> HostSnapshot {
        self.snapshot.clone()
    }
}

#[derive(Debug, Default)]
struct RunnerScript {
    probe_output: Option<String>,
    probe_failure: Option<String>,
    probe_timeout: bool,
    extraction_failure: Option<String>,
    extraction_timeout: bool,
    extraction_delay: Duration,
    invocations: Vec<ToolInvocation>,
}

/// Tool runner that answers ffprobe and ffmpeg invocations without
/// spawning anything.
///
/// Stream probes return [`fixture_probe_json`] unless scripted otherwise.
/// ffmpeg runs write a small file at the output path (the last argument).
#[derive(Debug, Default)]
pub struct ScriptedToolRunner {
    script: Mutex<RunnerScript>,
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every stream probe exit with status 1.
    pub fn fail_probe(&self, stderr: &str) {
        self.script.lock().probe_failure = Some(stderr.to_string());
    }

    /// Makes every ffmpeg run leave a partial output and exit with status 1.
    pub fn fail_extraction(&self, stderr: &str) {
        self.script.lock().extraction_failure = Some(stderr.to_string());
    }

    /// Makes every stream probe report that it was killed at its timeout.
    pub fn time_out_probe(&self) {
        self.script.lock().probe_timeout = true;
    }

    /// Makes every ffmpeg run leave a partial output and report that it was
    /// killed at its timeout.
    pub fn time_out_extraction(&self) {
        self.script.lock().extraction_timeout = true;
    }

    /// Lets ffmpeg runs succeed again.
    pub fn heal_extraction(&self) {
        let mut script = self.script.lock();
        script.extraction_failure = None;
        script.extraction_timeout = false;
    }

    pub fn set_probe_output(&self, json: &str) {
        self.script.lock().probe_output = Some(json.to_string());
    }

    /// Makes ffmpeg runs take `delay` before producing output.
    pub fn set_extraction_delay(&self, delay: Duration) {
        self.script.lock().extraction_delay = delay;
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.script.lock().invocations.clone()
    }

    /// Number of ffmpeg runs so far.
    pub fn extraction_count(&self) -> usize {
        self.script
            .lock()
            .invocations
            .iter()
            .filter(|invocation| !is_ffprobe(invocation))
            .count()
    }
}

fn has_arg(invocation: &ToolInvocation, arg: &str) -> bool {
    invocation.args.iter().any(|a| a == arg)
}

fn is_ffprobe(invocation: &ToolInvocation) -> bool {
    has_arg(invocation, "-show_streams") || has_arg(invocation, "-show_format")
}

fn exited(status: i32, stdout: Vec<u8>, stderr: String) -> ToolOutput {
    ToolOutput {
        status: Some(status),
        stdout,
        stderr,
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let (
            probe_output,
            probe_failure,
            probe_timeout,
            extraction_failure,
            extraction_timeout,
            delay,
        ) = {
            let mut script = self.script.lock();
            script.invocations.push(invocation.clone());
            (
                script.probe_output.clone(),
                script.probe_failure.clone(),
                script.probe_timeout,
                script.extraction_failure.clone(),
                script.extraction_timeout,
                script.extraction_delay,
            )
        };
        let timed_out = || ToolError::Timeout {
            program: invocation.program.clone(),
            timeout: invocation.timeout,
        };

        if has_arg(invocation, "-show_streams") {
            if probe_timeout {
                return Err(timed_out());
            }
            return Ok(match probe_failure {
                Some(stderr) => exited(1, Vec::new(), stderr),
                None => exited(
                    0,
                    probe_output.unwrap_or_else(fixture_probe_json).into_bytes(),
                    String::new(),
                ),
            });
        }
        if has_arg(invocation, "-show_format") {
            let json = r#"{"format":{"duration":"61.5","tags":{"title":"Fixture","artist":"Tributary"}}}"#;
            return Ok(exited(0, json.as_bytes().to_vec(), String::new()));
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let Some(output) = invocation.args.last() else {
            return Ok(exited(1, Vec::new(), "No output file".to_string()));
        };
        let io_error = |source| ToolError::Io {
            program: invocation.program.clone(),
            source,
        };
        if extraction_timeout {
            tokio::fs::write(output, b"partial").await.map_err(io_error)?;
            return Err(timed_out());
        }
        match extraction_failure {
            Some(stderr) => {
                tokio::fs::write(output, b"partial").await.map_err(io_error)?;
                Ok(exited(1, Vec::new(), stderr))
            }
            None => {
                tokio::fs::write(output, vec![7u8; 1024])
                    .await
                    .map_err(io_error)?;
                Ok(exited(0, Vec::new(), String::new()))
            }
        }
    }
}

/// Scripted behaviour of one download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadScript {
    /// Writes exactly the declared size
    Complete,
    /// Writes this many bytes and reports success
    Short(u64),
    /// Leaves a partial staging file and fails with a network error
    Fail(String),
    NotModified,
}

/// A file handed to [`ScriptedTransport::send_file`] successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct SentFile {
    pub chat: ChatId,
    pub path: std::path::PathBuf,
    pub kind: OutboundKind,
    pub caption: String,
    pub reply_to: Option<MessageId>,
}

/// A text message as last shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShownMessage {
    pub message: MessageRef,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAnswer {
    pub query_id: String,
    pub text: String,
    pub show_alert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedMessage {
    pub to: ChatId,
    pub source: MessageRef,
    pub caption: Option<String>,
}

#[derive(Debug, Default)]
struct TransportLog {
    downloads: VecDeque<DownloadScript>,
    failing_upload_chats: HashSet<ChatId>,
    edit_errors: VecDeque<TransportError>,
    sent_messages: Vec<ShownMessage>,
    edits: Vec<ShownMessage>,
    sent_files: Vec<SentFile>,
    answers: Vec<CallbackAnswer>,
    deleted: Vec<MessageRef>,
    copies: Vec<CopiedMessage>,
}

/// In-memory transport recording everything the pipeline does.
#[derive(Debug)]
pub struct ScriptedTransport {
    log: Mutex<TransportLog>,
    download_attempts: AtomicUsize,
    edit_attempts: AtomicUsize,
    next_message: AtomicI64,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(TransportLog::default()),
            download_attempts: AtomicUsize::new(0),
            edit_attempts: AtomicUsize::new(0),
            next_message: AtomicI64::new(1000),
        }
    }

    /// Queues the behaviour of the next download attempt. Attempts beyond
    /// the queue complete normally.
    pub fn script_download(&self, script: DownloadScript) {
        self.log.lock().downloads.push_back(script);
    }

    pub fn download_attempts(&self) -> usize {
        self.download_attempts.load(Ordering::SeqCst)
    }

    /// Rejects every file sent to `chat`.
    pub fn fail_uploads_to(&self, chat: ChatId) {
        self.log.lock().failing_upload_chats.insert(chat);
    }

    pub fn heal_uploads(&self) {
        self.log.lock().failing_upload_chats.clear();
    }

    /// Queues an error for the next edit.
    pub fn script_edit_error(&self, error: TransportError) {
        self.log.lock().edit_errors.push_back(error);
    }

    pub fn edit_attempts(&self) -> usize {
        self.edit_attempts.load(Ordering::SeqCst)
    }

    pub fn sent_files(&self) -> Vec<SentFile> {
        self.log.lock().sent_files.clone()
    }

    pub fn sent_messages(&self) -> Vec<ShownMessage> {
        self.log.lock().sent_messages.clone()
    }

    pub fn edits(&self) -> Vec<ShownMessage> {
        self.log.lock().edits.clone()
    }

    pub fn answers(&self) -> Vec<CallbackAnswer> {
        self.log.lock().answers.clone()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.log.lock().deleted.clone()
    }

    pub fn copies(&self) -> Vec<CopiedMessage> {
        self.log.lock().copies.clone()
    }

    /// What `message` currently shows: its latest edit or its original text.
    pub fn current(&self, message: MessageRef) -> Option<ShownMessage> {
        let log = self.log.lock();
        log.edits
            .iter()
            .rev()
            .chain(log.sent_messages.iter())
            .find(|shown| shown.message == message)
            .cloned()
    }

    fn next_ref(&self, chat: ChatId) -> MessageRef {
        let id = self.next_message.fetch_add(1, Ordering::SeqCst);
        MessageRef::new(chat, MessageId::new(id))
    }
}

async fn write_bytes(path: &Path, len: u64) -> Result<(), TransportError> {
    let len = usize::try_from(len).map_err(|_| TransportError::Rejected {
        reason: format!("Scripted size {len} too large"),
    })?;
    tokio::fs::write(path, vec![0u8; len])
        .await
        .map_err(|source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl MessagingTransport for ScriptedTransport {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
        _reply_to: Option<MessageId>,
    ) -> Result<MessageRef, TransportError> {
        let message = self.next_ref(chat);
        self.log.lock().sent_messages.push(ShownMessage {
            message,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(message)
    }

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        self.edit_attempts.fetch_add(1, Ordering::SeqCst);
        let mut log = self.log.lock();
        if let Some(error) = log.edit_errors.pop_front() {
            return Err(error);
        }
        log.edits.push(ShownMessage {
            message,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), TransportError> {
        self.log.lock().deleted.push(message);
        Ok(())
    }

    async fn answer_callback(
        &self,
        query_id: &str,
        text: &str,
        show_alert: bool,
    ) -> Result<(), TransportError> {
        self.log.lock().answers.push(CallbackAnswer {
            query_id: query_id.to_string(),
            text: text.to_string(),
            show_alert,
        });
        Ok(())
    }

    async fn download_file(
        &self,
        file: &InboundFile,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<u64, TransportError> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .log
            .lock()
            .downloads
            .pop_front()
            .unwrap_or(DownloadScript::Complete);

        let total = file.declared_size;
        match script {
            DownloadScript::Complete => {
                if let Some(callback) = &progress {
                    callback(total / 2, total);
                }
                write_bytes(destination, total).await?;
                if let Some(callback) = &progress {
                    callback(total, total);
                }
                Ok(total)
            }
            DownloadScript::Short(written) => {
                write_bytes(destination, written).await?;
                if let Some(callback) = &progress {
                    callback(written, total);
                }
                Ok(written)
            }
            DownloadScript::Fail(reason) => {
                write_bytes(&staging_path(destination), total / 2).await?;
                if let Some(callback) = &progress {
                    callback(total / 2, total);
                }
                Err(TransportError::Network { reason })
            }
            DownloadScript::NotModified => Err(TransportError::NotModified),
        }
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutboundFile,
        reply_to: Option<MessageId>,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef, TransportError> {
        if self.log.lock().failing_upload_chats.contains(&chat) {
            return Err(TransportError::Rejected {
                reason: format!("Uploads to chat {chat} are scripted to fail"),
            });
        }

        let size = tokio::fs::metadata(&file.path)
            .await
            .map_err(|source| TransportError::Io {
                path: file.path.clone(),
                source,
            })?
            .len();
        if let Some(callback) = &progress {
            callback(size, size);
        }

        let message = self.next_ref(chat);
        self.log.lock().sent_files.push(SentFile {
            chat,
            path: file.path.clone(),
            kind: file.kind.clone(),
            caption: file.caption.clone(),
            reply_to,
        });
        Ok(message)
    }

    async fn copy_message(
        &self,
        to: ChatId,
        source: MessageRef,
        caption: Option<&str>,
    ) -> Result<MessageRef, TransportError> {
        let message = self.next_ref(to);
        self.log.lock().copies.push(CopiedMessage {
            to,
            source,
            caption: caption.map(str::to_string),
        });
        Ok(message)
    }
}
