//! Identifiers shared by every pipeline component.

use std::fmt;

/// Identifier of a user on the messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(i64);

impl UserId {
    /// Creates a user id from its raw transport value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw transport value.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chat (private conversation, group or channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(i64);

impl ChatId {
    /// Creates a chat id from its raw transport value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw transport value.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message within a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(i64);

impl MessageId {
    /// Creates a message id from its raw transport value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw transport value.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified reference to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat: ChatId,
    pub message: MessageId,
}

impl MessageRef {
    pub fn new(chat: ChatId, message: MessageId) -> Self {
        Self { chat, message }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.chat, self.message)
    }
}

/// Opaque key tying together a transfer, its probe results and every later
/// selection, extraction and upload of one pipeline instance.
///
/// Derived from the prompt message that started the pipeline, so it is
/// unique per chat for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps an already encoded correlation id.
    ///
    /// Callback payloads carry the id as text; this is the inverse of
    /// [`CorrelationId::as_str`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the correlation id for a pipeline started from `message`.
    pub fn from_message(message: MessageRef) -> Self {
        Self(message.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user who submitted a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub first_name: String,
    pub username: Option<String>,
}

impl Requester {
    pub fn new(id: UserId, first_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            username: None,
        }
    }

    /// Adds the optional transport username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Name used in captions and logs, falling back to the numeric id.
    pub fn display_name(&self) -> String {
        if self.first_name.trim().is_empty() {
            format!("user {}", self.id)
        } else {
            self.first_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_from_message() {
        let message = MessageRef::new(ChatId::new(-1001), MessageId::new(42));
        let correlation = CorrelationId::from_message(message);

        assert_eq!(correlation.as_str(), "-1001-42");
        assert_eq!(CorrelationId::new("-1001-42"), correlation);
    }

    #[test]
    fn test_requester_display_name_fallback() {
        let named = Requester::new(UserId::new(7), "Ada");
        assert_eq!(named.display_name(), "Ada");

        let unnamed = Requester::new(UserId::new(7), "  ");
        assert_eq!(unnamed.display_name(), "user 7");
    }
}
