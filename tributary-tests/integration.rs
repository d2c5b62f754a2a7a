//! Integration tests for Tributary
//!
//! These tests drive the pipeline coordinator end to end against the
//! scripted transport and tool runner, checking how admission, transfers,
//! selection, extraction, uploads and status reporting interact.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/admission_limits.rs"]
mod admission_limits;
#[path = "integration/pipeline_flow.rs"]
mod pipeline_flow;
#[path = "integration/selection_race.rs"]
mod selection_race;
#[path = "integration/status_report.rs"]
mod status_report;
#[path = "integration/transfer_retry.rs"]
mod transfer_retry;
