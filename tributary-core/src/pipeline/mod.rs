//! Pipeline orchestration: state machine, task supervision, user-facing
//! texts and the coordinator tying the engines together.

pub mod coordinator;
pub mod messages;
pub mod state;
pub mod supervisor;

pub use coordinator::{PipelineCoordinator, PipelineServices};
pub use state::{
    FailureKind, IllegalTransition, PipelineEvent, PipelineState, PipelineStates, StateError,
    transition,
};
pub use supervisor::{ShutdownReport, TaskSupervisor};
