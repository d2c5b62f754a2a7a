//! Shared progress tracking for in-flight downloads and uploads.
//!
//! The transfer and upload engines register an [`ActiveTransfer`] for the
//! duration of each transfer and feed it through a rate-limited callback.
//! The status reporter and the progress button read snapshots concurrently.

pub mod record;
pub mod registry;
pub mod sampler;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub use record::ProgressRecord;
pub use registry::{ProgressError, ProgressRegistry, TransferTracker};
pub use sampler::ProgressSampler;

use crate::ids::CorrelationId;

/// Callback invoked by the transport with `(bytes_transferred, bytes_total)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Direction of a tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Source file coming from the transport to local storage
    Download,
    /// Extracted stream going back to the requester
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Snapshot of one in-flight transfer.
///
/// Byte counts are the source of truth; [`ProgressRecord`] is derived from
/// them for display.
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub correlation_id: CorrelationId,
    pub direction: Direction,
    pub file_name: String,
    pub total_bytes: u64,
    pub current_bytes: u64,
    pub started_at: Instant,
    pub last_sample_at: Option<Instant>,
}
