//! Explicit pipeline state machine.
//!
//! Each pipeline moves through
//! `AwaitingConfirmation → Transferring → AwaitingSelection → Extracting →
//! Uploading → Succeeded`, with `Cancelled` and `Failed` as exits. Every
//! move goes through [`transition`]; anything it does not list is an
//! [`IllegalTransition`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::ids::CorrelationId;

/// Finished pipelines remembered for [`PipelineStates::outcome`].
const RECENT_OUTCOMES: usize = 128;

/// Why a pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    AdmissionRejected,
    TransferFailed,
    ProbeFailed,
    /// Probe succeeded but found no audio or subtitle stream
    NoStreams,
    SelectionNotFound,
    ExtractionFailed,
    /// Source file vanished; nothing left to retry
    SourceMissing,
    UploadFailed,
}

impl FailureKind {
    /// Failures that keep the source and bucket so another stream can be
    /// chosen.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::SelectionNotFound
                | FailureKind::ExtractionFailed
                | FailureKind::UploadFailed
        )
    }
}

/// Where a pipeline is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    AwaitingConfirmation,
    Transferring,
    AwaitingSelection,
    Extracting { index: u32 },
    Uploading { index: u32 },
    Succeeded,
    Cancelled,
    Failed(FailureKind),
}

impl PipelineState {
    /// Whether the pipeline is over and its state can be dropped.
    pub fn is_terminal(self) -> bool {
        match self {
            PipelineState::Succeeded | PipelineState::Cancelled => true,
            PipelineState::Failed(kind) => !kind.is_retryable(),
            _ => false,
        }
    }

    /// Whether a stream may be selected now.
    pub fn accepts_selection(self) -> bool {
        match self {
            PipelineState::AwaitingSelection => true,
            PipelineState::Failed(kind) => kind.is_retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::AwaitingConfirmation => f.write_str("awaiting confirmation"),
            PipelineState::Transferring => f.write_str("transferring"),
            PipelineState::AwaitingSelection => f.write_str("awaiting selection"),
            PipelineState::Extracting { index } => write!(f, "extracting stream {index}"),
            PipelineState::Uploading { index } => write!(f, "uploading stream {index}"),
            PipelineState::Succeeded => f.write_str("succeeded"),
            PipelineState::Cancelled => f.write_str("cancelled"),
            PipelineState::Failed(kind) => write!(f, "failed ({kind:?})"),
        }
    }
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Proceed,
    AdmissionRejected,
    TransferFailed,
    ProbeFailed,
    StreamsReady,
    NoStreams,
    StreamSelected { index: u32 },
    SelectionMissing,
    Cancel,
    ExtractionSucceeded,
    ExtractionFailed { source_missing: bool },
    UploadSucceeded,
    UploadFailed,
}

/// An event that is not valid in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Event {event:?} is not valid while {from}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub event: PipelineEvent,
}

/// Computes the next state.
///
/// # Errors
///
/// - `IllegalTransition` - The event is not valid in `from`
pub fn transition(
    from: PipelineState,
    event: PipelineEvent,
) -> Result<PipelineState, IllegalTransition> {
    use PipelineEvent as E;
    use PipelineState as S;

    let next = match (from, event) {
        (S::AwaitingConfirmation, E::Proceed) => S::Transferring,
        (S::AwaitingConfirmation, E::AdmissionRejected) => S::Failed(FailureKind::AdmissionRejected),
        (S::AwaitingConfirmation, E::Cancel) => S::Cancelled,

        (S::Transferring, E::TransferFailed) => S::Failed(FailureKind::TransferFailed),
        (S::Transferring, E::ProbeFailed) => S::Failed(FailureKind::ProbeFailed),
        (S::Transferring, E::NoStreams) => S::Failed(FailureKind::NoStreams),
        (S::Transferring, E::StreamsReady) => S::AwaitingSelection,

        (state, E::StreamSelected { index }) if state.accepts_selection() => {
            S::Extracting { index }
        }
        (state, E::SelectionMissing) if state.accepts_selection() => {
            S::Failed(FailureKind::SelectionNotFound)
        }
        (state, E::Cancel) if state.accepts_selection() => S::Cancelled,

        (S::Extracting { index }, E::ExtractionSucceeded) => S::Uploading { index },
        (S::Extracting { .. }, E::ExtractionFailed { source_missing }) => {
            if source_missing {
                S::Failed(FailureKind::SourceMissing)
            } else {
                S::Failed(FailureKind::ExtractionFailed)
            }
        }
        // Applied once the running extraction has finished
        (S::Extracting { .. }, E::Cancel) => S::Cancelled,

        (S::Uploading { .. }, E::UploadSucceeded) => S::Succeeded,
        (S::Uploading { .. }, E::UploadFailed) => S::Failed(FailureKind::UploadFailed),

        (from, event) => return Err(IllegalTransition { from, event }),
    };
    Ok(next)
}

/// Errors raised by the state table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("No pipeline for {correlation_id}")]
    Unknown { correlation_id: CorrelationId },

    #[error("A pipeline for {correlation_id} already exists")]
    Duplicate { correlation_id: CorrelationId },

    #[error(transparent)]
    Illegal(#[from] IllegalTransition),
}

#[derive(Debug, Default)]
struct StateTable {
    active: HashMap<CorrelationId, PipelineState>,
    finished: VecDeque<(CorrelationId, PipelineState)>,
}

/// Current state of every live pipeline.
///
/// Terminal pipelines leave the table; the most recent outcomes stay
/// queryable through [`PipelineStates::outcome`].
#[derive(Debug, Clone)]
pub struct PipelineStates {
    table: Arc<Mutex<StateTable>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for PipelineStates {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            table: Arc::new(Mutex::new(StateTable::default())),
            changes: Arc::new(changes),
        }
    }
}

impl PipelineStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pipeline awaiting confirmation.
    ///
    /// # Errors
    ///
    /// - `StateError::Duplicate` - The id is already live
    pub fn start(&self, correlation_id: &CorrelationId) -> Result<(), StateError> {
        {
            let mut table = self.table.lock();
            if table.active.contains_key(correlation_id) {
                return Err(StateError::Duplicate {
                    correlation_id: correlation_id.clone(),
                });
            }
            table
                .active
                .insert(correlation_id.clone(), PipelineState::AwaitingConfirmation);
        }
        self.notify();
        Ok(())
    }

    /// Applies `event` atomically and returns the new state.
    ///
    /// # Errors
    ///
    /// - `StateError::Unknown` - No live pipeline has this id
    /// - `StateError::Illegal` - The event is not valid in the current state
    pub fn apply(
        &self,
        correlation_id: &CorrelationId,
        event: PipelineEvent,
    ) -> Result<PipelineState, StateError> {
        let next = {
            let mut table = self.table.lock();
            let current = *table
                .active
                .get(correlation_id)
                .ok_or_else(|| StateError::Unknown {
                    correlation_id: correlation_id.clone(),
                })?;
            let next = transition(current, event)?;

            if next.is_terminal() {
                table.active.remove(correlation_id);
                if table.finished.len() == RECENT_OUTCOMES {
                    table.finished.pop_front();
                }
                table.finished.push_back((correlation_id.clone(), next));
            } else {
                table.active.insert(correlation_id.clone(), next);
            }
            next
        };

        tracing::debug!("Pipeline {} -> {} on {:?}", correlation_id, next, event);
        self.notify();
        Ok(next)
    }

    /// Current state of a live pipeline.
    pub fn get(&self, correlation_id: &CorrelationId) -> Option<PipelineState> {
        self.table.lock().active.get(correlation_id).copied()
    }

    /// Live state, or the terminal state of a recently finished pipeline.
    pub fn outcome(&self, correlation_id: &CorrelationId) -> Option<PipelineState> {
        let table = self.table.lock();
        table.active.get(correlation_id).copied().or_else(|| {
            table
                .finished
                .iter()
                .rev()
                .find(|(id, _)| id == correlation_id)
                .map(|(_, state)| *state)
        })
    }

    /// Drops a live pipeline without a transition, e.g. when its selection
    /// expired.
    pub fn remove(&self, correlation_id: &CorrelationId) -> Option<PipelineState> {
        let removed = self.table.lock().active.remove(correlation_id);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().active.len()
    }

    /// Waits until the pipeline's outcome satisfies `predicate`.
    ///
    /// Returns `None` on timeout.
    pub async fn wait_until<F>(
        &self,
        correlation_id: &CorrelationId,
        timeout: Duration,
        predicate: F,
    ) -> Option<PipelineState>
    where
        F: Fn(PipelineState) -> bool,
    {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                if let Some(state) = self.outcome(correlation_id).filter(|s| predicate(*s)) {
                    return Some(state);
                }
                if changes.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = PipelineState::AwaitingConfirmation;
        for event in [
            PipelineEvent::Proceed,
            PipelineEvent::StreamsReady,
            PipelineEvent::StreamSelected { index: 1 },
            PipelineEvent::ExtractionSucceeded,
            PipelineEvent::UploadSucceeded,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, PipelineState::Succeeded);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_retry_after_extraction_failure() {
        let failed = transition(
            PipelineState::Extracting { index: 1 },
            PipelineEvent::ExtractionFailed {
                source_missing: false,
            },
        )
        .unwrap();
        assert_eq!(failed, PipelineState::Failed(FailureKind::ExtractionFailed));
        assert!(!failed.is_terminal());

        let retried = transition(failed, PipelineEvent::StreamSelected { index: 2 }).unwrap();
        assert_eq!(retried, PipelineState::Extracting { index: 2 });
    }

    #[test]
    fn test_missing_source_is_terminal() {
        let failed = transition(
            PipelineState::Extracting { index: 1 },
            PipelineEvent::ExtractionFailed {
                source_missing: true,
            },
        )
        .unwrap();
        assert!(failed.is_terminal());
        assert!(transition(failed, PipelineEvent::StreamSelected { index: 1 }).is_err());
    }

    #[test]
    fn test_illegal_transitions() {
        let cases = [
            (PipelineState::AwaitingConfirmation, PipelineEvent::StreamsReady),
            (PipelineState::Transferring, PipelineEvent::Proceed),
            (PipelineState::Extracting { index: 1 }, PipelineEvent::StreamSelected { index: 2 }),
            (PipelineState::Uploading { index: 1 }, PipelineEvent::Cancel),
            (PipelineState::Succeeded, PipelineEvent::Cancel),
            (
                PipelineState::Failed(FailureKind::TransferFailed),
                PipelineEvent::StreamSelected { index: 1 },
            ),
        ];
        for (from, event) in cases {
            assert_eq!(
                transition(from, event),
                Err(IllegalTransition { from, event }),
                "{from} on {event:?}"
            );
        }
    }

    #[test]
    fn test_table_drops_terminal_entries() {
        let states = PipelineStates::new();
        let id = CorrelationId::new("1-1");

        states.start(&id).unwrap();
        assert!(matches!(states.start(&id), Err(StateError::Duplicate { .. })));

        let rejected = states.apply(&id, PipelineEvent::AdmissionRejected).unwrap();
        assert_eq!(rejected, PipelineState::Failed(FailureKind::AdmissionRejected));
        assert_eq!(states.get(&id), None);
        assert_eq!(states.outcome(&id), Some(rejected));
        assert!(matches!(
            states.apply(&id, PipelineEvent::Proceed),
            Err(StateError::Unknown { .. })
        ));
    }

    #[test]
    fn test_double_proceed_is_illegal() {
        let states = PipelineStates::new();
        let id = CorrelationId::new("1-1");
        states.start(&id).unwrap();

        states.apply(&id, PipelineEvent::Proceed).unwrap();
        assert!(matches!(
            states.apply(&id, PipelineEvent::Proceed),
            Err(StateError::Illegal(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_until_observes_changes() {
        let states = PipelineStates::new();
        let id = CorrelationId::new("1-1");
        states.start(&id).unwrap();

        let waiter = {
            let states = states.clone();
            let id = id.clone();
            tokio::spawn(async move {
                states
                    .wait_until(&id, Duration::from_secs(5), |s| s == PipelineState::Cancelled)
                    .await
            })
        };
        states.apply(&id, PipelineEvent::Cancel).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(PipelineState::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let states = PipelineStates::new();
        let id = CorrelationId::new("1-1");
        states.start(&id).unwrap();

        let result = states
            .wait_until(&id, Duration::from_millis(20), |s| s == PipelineState::Succeeded)
            .await;
        assert_eq!(result, None);
    }
}
