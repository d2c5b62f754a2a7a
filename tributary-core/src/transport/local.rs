//! Filesystem-backed transport used by the command line tool.
//!
//! Inbound file ids are local paths. Outbound files land in an outbox
//! directory and messages are written to the log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{InboundFile, Keyboard, MessagingTransport, OutboundFile, TransportError};
use crate::ids::{ChatId, MessageId, MessageRef};
use crate::progress::ProgressCallback;
use crate::storage::sanitize_file_name;

const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Transport that reads and writes the local filesystem.
#[derive(Debug)]
pub struct LocalTransport {
    outbox: PathBuf,
    next_message: AtomicI64,
}

impl LocalTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            next_message: AtomicI64::new(1),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn next_ref(&self, chat: ChatId) -> MessageRef {
        let id = self.next_message.fetch_add(1, Ordering::Relaxed);
        MessageRef::new(chat, MessageId::new(id))
    }

    async fn copy_with_progress(
        source: &Path,
        destination: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, TransportError> {
        let read_error = |source_err| TransportError::Io {
            path: source.to_path_buf(),
            source: source_err,
        };
        let write_error = |source_err| TransportError::Io {
            path: destination.to_path_buf(),
            source: source_err,
        };

        let mut input = tokio::fs::File::open(source).await.map_err(read_error)?;
        let total = input.metadata().await.map_err(read_error)?.len();
        let mut output = tokio::fs::File::create(destination)
            .await
            .map_err(write_error)?;

        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            let read = input.read(&mut buffer).await.map_err(read_error)?;
            if read == 0 {
                break;
            }
            output
                .write_all(&buffer[..read])
                .await
                .map_err(write_error)?;
            copied += read as u64;
            if let Some(callback) = progress {
                callback(copied, total);
            }
        }
        output.flush().await.map_err(write_error)?;

        Ok(copied)
    }
}

fn render_keyboard(keyboard: Option<&Keyboard>) -> String {
    keyboard
        .map(|keyboard| {
            keyboard
                .buttons()
                .map(|button| format!("[{}]", button.label))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

#[async_trait]
impl MessagingTransport for LocalTransport {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
        _reply_to: Option<MessageId>,
    ) -> Result<MessageRef, TransportError> {
        let message = self.next_ref(chat);
        tracing::info!("[{}] {} {}", message, text, render_keyboard(keyboard));
        Ok(message)
    }

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        tracing::info!("[{} edited] {} {}", message, text, render_keyboard(keyboard));
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), TransportError> {
        tracing::debug!("[{} deleted]", message);
        Ok(())
    }

    async fn answer_callback(
        &self,
        query_id: &str,
        text: &str,
        _show_alert: bool,
    ) -> Result<(), TransportError> {
        tracing::info!("[callback {}] {}", query_id, text);
        Ok(())
    }

    async fn download_file(
        &self,
        file: &InboundFile,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<u64, TransportError> {
        let staging = super::staging_path(destination);
        let copied =
            Self::copy_with_progress(Path::new(&file.file_id), &staging, progress.as_ref()).await?;

        tokio::fs::rename(&staging, destination)
            .await
            .map_err(|source| TransportError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        Ok(copied)
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutboundFile,
        _reply_to: Option<MessageId>,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef, TransportError> {
        tokio::fs::create_dir_all(&self.outbox)
            .await
            .map_err(|source| TransportError::Io {
                path: self.outbox.clone(),
                source,
            })?;

        let name = file
            .path
            .file_name()
            .map(|name| sanitize_file_name(&name.to_string_lossy()))
            .unwrap_or_else(|| "file".to_string());
        let destination = self.outbox.join(name);
        let copied = Self::copy_with_progress(&file.path, &destination, progress.as_ref()).await?;

        let message = self.next_ref(chat);
        tracing::info!(
            "[{}] sent {} ({} bytes): {}",
            message,
            destination.display(),
            copied,
            file.caption
        );
        Ok(message)
    }

    async fn copy_message(
        &self,
        to: ChatId,
        source: MessageRef,
        caption: Option<&str>,
    ) -> Result<MessageRef, TransportError> {
        let message = self.next_ref(to);
        tracing::info!(
            "[{}] copy of {}: {}",
            message,
            source,
            caption.unwrap_or_default()
        );
        Ok(message)
    }
}
