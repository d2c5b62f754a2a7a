//! Concurrent registry of in-flight transfers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{ActiveTransfer, Direction, ProgressCallback, ProgressRecord, ProgressSampler};
use crate::ids::{CorrelationId, MessageRef};

/// Errors raised when registering a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("A transfer is already in progress for {correlation_id}")]
    AlreadyActive { correlation_id: CorrelationId },
}

#[derive(Debug)]
struct Entry {
    transfer: ActiveTransfer,
    display_key: MessageRef,
    token: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<CorrelationId, Entry>,
    records: HashMap<MessageRef, ProgressRecord>,
    next_token: u64,
}

/// Shared store of [`ActiveTransfer`] snapshots and their display records.
///
/// Written by the transfer and upload engines through [`TransferTracker`]
/// callbacks, read by the status reporter. Display records are keyed by the
/// message that shows them.
#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transfer and returns the guard that owns its entry.
    ///
    /// # Errors
    ///
    /// - `ProgressError::AlreadyActive` - Another transfer holds this correlation id
    pub fn begin(
        &self,
        correlation_id: &CorrelationId,
        direction: Direction,
        file_name: &str,
        total_bytes: u64,
        display_key: MessageRef,
    ) -> Result<TransferTracker, ProgressError> {
        let mut state = self.state.lock();
        if state.active.contains_key(correlation_id) {
            return Err(ProgressError::AlreadyActive {
                correlation_id: correlation_id.clone(),
            });
        }

        state.next_token += 1;
        let token = state.next_token;
        state.active.insert(
            correlation_id.clone(),
            Entry {
                transfer: ActiveTransfer {
                    correlation_id: correlation_id.clone(),
                    direction,
                    file_name: file_name.to_string(),
                    total_bytes,
                    current_bytes: 0,
                    started_at: Instant::now(),
                    last_sample_at: None,
                },
                display_key,
                token,
            },
        );

        Ok(TransferTracker {
            registry: self.clone(),
            correlation_id: correlation_id.clone(),
            token,
        })
    }

    /// Snapshot of every in-flight transfer, oldest first.
    pub fn active_transfers(&self) -> Vec<ActiveTransfer> {
        let state = self.state.lock();
        let mut transfers: Vec<ActiveTransfer> =
            state.active.values().map(|entry| entry.transfer.clone()).collect();
        transfers.sort_by_key(|transfer| transfer.started_at);
        transfers
    }

    /// Every in-flight transfer with its display record, oldest first.
    ///
    /// The record is `None` until the first sample is accepted.
    pub fn snapshot(&self) -> Vec<(ActiveTransfer, Option<ProgressRecord>)> {
        let state = self.state.lock();
        let mut entries: Vec<(ActiveTransfer, Option<ProgressRecord>)> = state
            .active
            .values()
            .map(|entry| {
                (
                    entry.transfer.clone(),
                    state.records.get(&entry.display_key).cloned(),
                )
            })
            .collect();
        entries.sort_by_key(|(transfer, _)| transfer.started_at);
        entries
    }

    /// Display record shown in `key`, if a sample has been accepted yet.
    pub fn record_for(&self, key: MessageRef) -> Option<ProgressRecord> {
        self.state.lock().records.get(&key).cloned()
    }

    /// Display record of the transfer running under `correlation_id`.
    pub fn record_for_correlation(&self, correlation_id: &CorrelationId) -> Option<ProgressRecord> {
        let state = self.state.lock();
        let entry = state.active.get(correlation_id)?;
        state.records.get(&entry.display_key).cloned()
    }

    pub fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.state.lock().active.contains_key(correlation_id)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    fn record_sample(
        &self,
        correlation_id: &CorrelationId,
        token: u64,
        current: u64,
        total: u64,
        now: Instant,
    ) {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get_mut(correlation_id) else {
            return;
        };
        if entry.token != token {
            return;
        }

        let transfer = &mut entry.transfer;
        transfer.current_bytes = current;
        if total > 0 {
            transfer.total_bytes = total;
        }
        transfer.last_sample_at = Some(now);

        let record = ProgressRecord::compute(
            &transfer.file_name,
            transfer.direction,
            transfer.current_bytes,
            transfer.total_bytes,
            now.saturating_duration_since(transfer.started_at),
        );
        let key = entry.display_key;
        state.records.insert(key, record);
    }

    fn restart(&self, correlation_id: &CorrelationId, token: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get_mut(correlation_id) else {
            return;
        };
        if entry.token != token {
            return;
        }

        entry.transfer.current_bytes = 0;
        entry.transfer.started_at = Instant::now();
        entry.transfer.last_sample_at = None;
        let key = entry.display_key;
        state.records.remove(&key);
    }

    fn finish(&self, correlation_id: &CorrelationId, token: u64) {
        let mut state = self.state.lock();
        let owned = state
            .active
            .get(correlation_id)
            .is_some_and(|entry| entry.token == token);
        if !owned {
            return;
        }

        if let Some(entry) = state.active.remove(correlation_id) {
            state.records.remove(&entry.display_key);
            tracing::trace!(
                "Progress entry for {} {} removed",
                entry.transfer.direction,
                correlation_id
            );
        }
    }
}

/// Owns one registry entry; removes it and its display record on drop.
#[derive(Debug)]
pub struct TransferTracker {
    registry: ProgressRegistry,
    correlation_id: CorrelationId,
    token: u64,
}

impl TransferTracker {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Builds the callback handed to the transport. Samples are accepted at
    /// most once per `interval` and always on completion. Samples arriving
    /// after the tracker is gone are ignored.
    pub fn callback(&self, interval: Duration) -> ProgressCallback {
        let registry = self.registry.clone();
        let correlation_id = self.correlation_id.clone();
        let token = self.token;
        let sampler = ProgressSampler::new(interval);

        Arc::new(move |current, total| {
            let now = Instant::now();
            if sampler.accept(current, total, now) {
                registry.record_sample(&correlation_id, token, current, total, now);
            }
        })
    }

    /// Resets byte counts and timing before a retry attempt.
    pub fn restart(&self) {
        self.registry.restart(&self.correlation_id, self.token);
    }
}

impl Drop for TransferTracker {
    fn drop(&mut self) {
        self.registry.finish(&self.correlation_id, self.token);
    }
}
