//! Boundary to the chat service.
//!
//! The pipeline never talks to a bot API directly. Everything it needs from
//! the outside world goes through [`MessagingTransport`], so the same
//! coordinator runs against a real bot, the local CLI transport or the
//! scripted test transport.

pub mod keyboard;
pub mod local;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

pub use keyboard::{Button, CallbackAction, Keyboard, KeyboardError};
pub use local::LocalTransport;

use crate::ids::{ChatId, MessageId, MessageRef, Requester};
use crate::media::AudioMetadata;
use crate::progress::ProgressCallback;

/// Errors reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Message content was not modified")]
    NotModified,

    #[error("Message no longer exists")]
    MessageGone,

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Request rejected: {reason}")]
    Rejected { reason: String },

    #[error("Network failure: {reason}")]
    Network { reason: String },
}

/// Metadata of a file a user sent to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFile {
    /// Transport handle used to fetch the bytes
    pub file_id: String,
    pub file_name: String,
    /// Size announced by the transport, used to verify downloads
    pub declared_size: u64,
    pub mime_type: Option<String>,
    /// Message carrying the file
    pub message: MessageRef,
}

/// A button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    pub id: String,
    pub from: Requester,
    /// Message the pressed keyboard is attached to
    pub message: MessageRef,
    /// Opaque payload; decode with [`CallbackAction::decode`]
    pub payload: String,
}

/// How an outbound file should be presented.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundKind {
    Audio(AudioMetadata),
    Document,
}

/// A local file to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFile {
    pub path: PathBuf,
    pub kind: OutboundKind,
    pub caption: String,
}

/// Sibling path a transport may stage a download in before renaming it.
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut staged = destination.as_os_str().to_owned();
    staged.push(".temp");
    PathBuf::from(staged)
}

/// Operations the pipeline consumes from the chat service.
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Sends a text message, optionally with buttons, as a reply.
    ///
    /// # Errors
    /// - `TransportError::Rejected` - Chat unreachable or message refused
    /// - `TransportError::Network` - Connection failure
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef, TransportError>;

    /// Replaces the text and buttons of an existing message.
    ///
    /// # Errors
    /// - `TransportError::NotModified` - New content equals the current content
    /// - `TransportError::MessageGone` - Message was deleted
    /// - `TransportError::RateLimited` - Too many edits
    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError>;

    async fn delete_message(&self, message: MessageRef) -> Result<(), TransportError>;

    /// Acknowledges a button press, optionally as a modal alert.
    async fn answer_callback(
        &self,
        query_id: &str,
        text: &str,
        show_alert: bool,
    ) -> Result<(), TransportError>;

    /// Downloads an inbound file to `destination`, returning the bytes written.
    ///
    /// Implementations may stage data in `<destination>.temp` while running.
    ///
    /// # Errors
    /// - `TransportError::Io` - Destination cannot be written
    /// - `TransportError::Network` - Transfer interrupted
    async fn download_file(
        &self,
        file: &InboundFile,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<u64, TransportError>;

    /// Uploads a local file to `chat`.
    ///
    /// # Errors
    /// - `TransportError::Io` - Source cannot be read
    /// - `TransportError::Rejected` - File refused by the service
    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutboundFile,
        reply_to: Option<MessageId>,
        progress: Option<ProgressCallback>,
    ) -> Result<MessageRef, TransportError>;

    /// Copies an existing message, typically into an audit chat.
    async fn copy_message(
        &self,
        to: ChatId,
        source: MessageRef,
        caption: Option<&str>,
    ) -> Result<MessageRef, TransportError>;
}
