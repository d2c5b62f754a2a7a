//! Inline keyboards and the typed actions behind their buttons.
//!
//! Button payloads are plain strings on the wire. They are decoded exactly
//! once, at the transport boundary, into [`CallbackAction`].

use std::fmt;

use crate::ids::CorrelationId;

/// Errors raised when a payload cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyboardError {
    #[error("Unrecognised callback payload: {payload}")]
    UnknownAction { payload: String },

    #[error("Invalid stream index in payload: {payload}")]
    InvalidIndex { payload: String },

    #[error("Callback payload has no correlation id: {payload}")]
    MissingCorrelation { payload: String },
}

/// What pressing a button asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackAction {
    /// Start downloading the file offered in the confirmation prompt
    Proceed { correlation_id: CorrelationId },
    /// Decline the confirmation prompt
    Dismiss { correlation_id: CorrelationId },
    /// Show the progress of the running transfer
    ShowProgress { correlation_id: CorrelationId },
    /// Extract the stream with this index
    Select {
        correlation_id: CorrelationId,
        index: u32,
    },
    /// Abandon the selection and delete the source
    Cancel { correlation_id: CorrelationId },
    /// Delete the message carrying the keyboard
    Close,
}

impl CallbackAction {
    /// Wire representation of the action.
    pub fn encode(&self) -> String {
        match self {
            CallbackAction::Proceed { correlation_id } => format!("proceed:{correlation_id}"),
            CallbackAction::Dismiss { correlation_id } => format!("dismiss:{correlation_id}"),
            CallbackAction::ShowProgress { correlation_id } => {
                format!("progress:{correlation_id}")
            }
            CallbackAction::Select {
                correlation_id,
                index,
            } => format!("select:{index}:{correlation_id}"),
            CallbackAction::Cancel { correlation_id } => format!("cancel:{correlation_id}"),
            CallbackAction::Close => "close".to_string(),
        }
    }

    /// Parses a wire payload.
    ///
    /// # Errors
    ///
    /// - `KeyboardError::UnknownAction` - Unknown prefix
    /// - `KeyboardError::InvalidIndex` - Selection index is not a number
    /// - `KeyboardError::MissingCorrelation` - Correlation id is empty
    pub fn decode(payload: &str) -> Result<Self, KeyboardError> {
        if payload == "close" {
            return Ok(CallbackAction::Close);
        }

        let (tag, rest) = payload
            .split_once(':')
            .ok_or_else(|| KeyboardError::UnknownAction {
                payload: payload.to_string(),
            })?;

        let correlation = |raw: &str| {
            if raw.is_empty() {
                Err(KeyboardError::MissingCorrelation {
                    payload: payload.to_string(),
                })
            } else {
                Ok(CorrelationId::new(raw))
            }
        };

        match tag {
            "proceed" => Ok(CallbackAction::Proceed {
                correlation_id: correlation(rest)?,
            }),
            "dismiss" => Ok(CallbackAction::Dismiss {
                correlation_id: correlation(rest)?,
            }),
            "progress" => Ok(CallbackAction::ShowProgress {
                correlation_id: correlation(rest)?,
            }),
            "cancel" => Ok(CallbackAction::Cancel {
                correlation_id: correlation(rest)?,
            }),
            "select" => {
                let (index, id) = rest.split_once(':').unwrap_or((rest, ""));
                let index = index.parse().map_err(|_| KeyboardError::InvalidIndex {
                    payload: payload.to_string(),
                })?;
                Ok(CallbackAction::Select {
                    correlation_id: correlation(id)?,
                    index,
                })
            }
            _ => Err(KeyboardError::UnknownAction {
                payload: payload.to_string(),
            }),
        }
    }

    /// Correlation id the action refers to, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            CallbackAction::Proceed { correlation_id }
            | CallbackAction::Dismiss { correlation_id }
            | CallbackAction::ShowProgress { correlation_id }
            | CallbackAction::Select { correlation_id, .. }
            | CallbackAction::Cancel { correlation_id } => Some(correlation_id),
            CallbackAction::Close => None,
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One button of an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: CallbackAction,
}

impl Button {
    pub fn new(label: impl Into<String>, action: CallbackAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

/// Rows of buttons attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row of buttons.
    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        if !buttons.is_empty() {
            self.rows.push(buttons);
        }
        self
    }

    pub fn rows(&self) -> &[Vec<Button>] {
        &self.rows
    }

    /// Every button, row by row.
    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_select() {
        let action = CallbackAction::decode("select:2:-1001-42").unwrap();
        assert_eq!(
            action,
            CallbackAction::Select {
                correlation_id: CorrelationId::new("-1001-42"),
                index: 2
            }
        );
        assert_eq!(action.encode(), "select:2:-1001-42");
    }

    #[test]
    fn test_decode_simple_actions() {
        let id = CorrelationId::new("5-9");
        assert_eq!(
            CallbackAction::decode("proceed:5-9").unwrap(),
            CallbackAction::Proceed {
                correlation_id: id.clone()
            }
        );
        assert_eq!(
            CallbackAction::decode("cancel:5-9").unwrap(),
            CallbackAction::Cancel {
                correlation_id: id.clone()
            }
        );
        assert_eq!(
            CallbackAction::decode("progress:5-9").unwrap().correlation_id(),
            Some(&id)
        );
        assert_eq!(CallbackAction::decode("close").unwrap(), CallbackAction::Close);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            CallbackAction::decode("audio_1_abc"),
            Err(KeyboardError::UnknownAction { .. })
        ));
        assert!(matches!(
            CallbackAction::decode("select:x:5-9"),
            Err(KeyboardError::InvalidIndex { .. })
        ));
        assert!(matches!(
            CallbackAction::decode("select:3"),
            Err(KeyboardError::MissingCorrelation { .. })
        ));
        assert!(matches!(
            CallbackAction::decode("cancel:"),
            Err(KeyboardError::MissingCorrelation { .. })
        ));
    }

    #[test]
    fn test_keyboard_skips_empty_rows() {
        let keyboard = Keyboard::new()
            .row(vec![Button::new("Close", CallbackAction::Close)])
            .row(Vec::new());

        assert_eq!(keyboard.rows().len(), 1);
        assert_eq!(keyboard.buttons().count(), 1);
    }
}
