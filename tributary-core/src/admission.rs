//! Admission control for inbound transfers.
//!
//! Every download must hold a [`SlotGuard`] for its whole lifetime. Slots are
//! bounded per user and globally, and the storage mount must have enough free
//! space at acquisition time. Dropping the guard releases the slot, so every
//! exit path of a pipeline gives its reservation back.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::AdmissionConfig;
use crate::ids::{CorrelationId, UserId};
use crate::storage::{DiskSpaceProbe, StorageError, available_space_off_thread};

/// Reasons a transfer was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejection {
    #[error("User {owner} already holds {limit} concurrent transfers")]
    PerUserLimitExceeded { owner: UserId, limit: usize },

    #[error("All {capacity} transfer slots are in use")]
    GlobalCapacityExceeded { capacity: usize },

    #[error("Low disk space: {available} bytes available, {required} bytes required")]
    LowDiskSpace { available: u64, required: u64 },

    #[error("Storage unavailable: {reason}")]
    StorageUnavailable { reason: String },
}

impl AdmissionRejection {
    /// Whether the rejection comes from the concurrency ceilings.
    pub fn is_slot_exhausted(&self) -> bool {
        matches!(
            self,
            AdmissionRejection::PerUserLimitExceeded { .. }
                | AdmissionRejection::GlobalCapacityExceeded { .. }
        )
    }
}

/// Identifier of an admitted transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// A reservation against the admission ceilings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSlot {
    pub id: SlotId,
    pub owner: UserId,
    pub correlation_id: CorrelationId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    slots: HashMap<SlotId, TransferSlot>,
    per_owner: HashMap<UserId, usize>,
    next_id: u64,
}

impl AdmissionState {
    fn remove(&mut self, id: SlotId) -> Option<TransferSlot> {
        let slot = self.slots.remove(&id)?;
        if let Some(count) = self.per_owner.get_mut(&slot.owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_owner.remove(&slot.owner);
            }
        }
        Some(slot)
    }
}

/// Shared gate deciding whether a new transfer may start.
///
/// Cheap to clone; all clones share the same slot table.
#[derive(Clone)]
pub struct AdmissionController {
    config: AdmissionConfig,
    storage_root: PathBuf,
    disk: Arc<dyn DiskSpaceProbe>,
    state: Arc<Mutex<AdmissionState>>,
}

impl AdmissionController {
    /// Creates a controller checking free space on the disk holding
    /// `storage_root`.
    pub fn new(
        config: AdmissionConfig,
        storage_root: impl Into<PathBuf>,
        disk: Arc<dyn DiskSpaceProbe>,
    ) -> Self {
        Self {
            config,
            storage_root: storage_root.into(),
            disk,
            state: Arc::new(Mutex::new(AdmissionState::default())),
        }
    }

    /// Reserves a slot for `owner`, inspecting the disk on the blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionController::try_acquire`].
    pub async fn acquire(
        &self,
        owner: UserId,
        correlation_id: &CorrelationId,
    ) -> Result<SlotGuard, AdmissionRejection> {
        let available = if self.config.min_free_space > 0 {
            Some(
                available_space_off_thread(Arc::clone(&self.disk), self.storage_root.clone())
                    .await,
            )
        } else {
            None
        };
        self.admit(owner, correlation_id, available)
    }

    /// Reserves a slot for `owner`.
    ///
    /// Checks run in order: per-user limit, global capacity, free space.
    /// The disk is inspected before the slot table is locked so a slow
    /// filesystem never blocks other admissions.
    ///
    /// # Errors
    ///
    /// - `AdmissionRejection::PerUserLimitExceeded` - Owner is at the per-user limit
    /// - `AdmissionRejection::GlobalCapacityExceeded` - All slots are taken
    /// - `AdmissionRejection::LowDiskSpace` - Free space is below the threshold
    /// - `AdmissionRejection::StorageUnavailable` - Free space cannot be determined
    pub fn try_acquire(
        &self,
        owner: UserId,
        correlation_id: &CorrelationId,
    ) -> Result<SlotGuard, AdmissionRejection> {
        let available = if self.config.min_free_space > 0 {
            Some(self.disk.available_space(&self.storage_root))
        } else {
            None
        };
        self.admit(owner, correlation_id, available)
    }

    fn admit(
        &self,
        owner: UserId,
        correlation_id: &CorrelationId,
        available: Option<Result<u64, StorageError>>,
    ) -> Result<SlotGuard, AdmissionRejection> {
        let slot = {
            let mut state = self.state.lock();

            let held = state.per_owner.get(&owner).copied().unwrap_or(0);
            if held >= self.config.per_user_limit {
                return Err(AdmissionRejection::PerUserLimitExceeded {
                    owner,
                    limit: self.config.per_user_limit,
                });
            }

            let capacity = self.config.global_capacity();
            if state.slots.len() >= capacity {
                return Err(AdmissionRejection::GlobalCapacityExceeded { capacity });
            }

            match available {
                Some(Ok(bytes)) if bytes < self.config.min_free_space => {
                    return Err(AdmissionRejection::LowDiskSpace {
                        available: bytes,
                        required: self.config.min_free_space,
                    });
                }
                Some(Err(e)) => {
                    return Err(AdmissionRejection::StorageUnavailable {
                        reason: e.to_string(),
                    });
                }
                _ => {}
            }

            state.next_id += 1;
            let slot = TransferSlot {
                id: SlotId(state.next_id),
                owner,
                correlation_id: correlation_id.clone(),
                started_at: Utc::now(),
            };
            state.slots.insert(slot.id, slot.clone());
            *state.per_owner.entry(owner).or_insert(0) += 1;
            slot
        };

        tracing::debug!(
            "Admitted {} for user {} ({})",
            slot.id,
            owner,
            correlation_id
        );

        Ok(SlotGuard {
            controller: self.clone(),
            slot,
            released: false,
        })
    }

    /// Releases a slot. Unknown or already released slots are ignored.
    ///
    /// Returns whether a slot was actually freed.
    pub fn release(&self, id: SlotId) -> bool {
        let removed = self.state.lock().remove(id);
        match removed {
            Some(slot) => {
                tracing::debug!(
                    "Released {} for user {} ({})",
                    slot.id,
                    slot.owner,
                    slot.correlation_id
                );
                true
            }
            None => false,
        }
    }

    /// Number of slots currently held across all users.
    pub fn active_slots(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of slots currently held by `owner`.
    pub fn slots_held_by(&self, owner: UserId) -> usize {
        self.state.lock().per_owner.get(&owner).copied().unwrap_or(0)
    }

    /// Snapshot of every held slot, oldest first.
    pub fn slots(&self) -> Vec<TransferSlot> {
        let mut slots: Vec<TransferSlot> = self.state.lock().slots.values().cloned().collect();
        slots.sort_by_key(|slot| slot.id);
        slots
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

/// Scoped ownership of an admitted slot; releases it on drop.
pub struct SlotGuard {
    controller: AdmissionController,
    slot: TransferSlot,
    released: bool,
}

impl SlotGuard {
    pub fn slot(&self) -> &TransferSlot {
        &self.slot
    }

    /// Releases the slot now instead of at drop.
    pub fn release(mut self) {
        self.released = true;
        self.controller.release(self.slot.id);
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("slot", &self.slot)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            self.controller.release(self.slot.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::testing::FixedDiskSpace;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn controller(per_user_limit: usize, capacity_factor: usize) -> AdmissionController {
        let config = AdmissionConfig {
            per_user_limit,
            capacity_factor,
            min_free_space: GIB,
        };
        AdmissionController::new(config, "/tmp", Arc::new(FixedDiskSpace::new(10 * GIB)))
    }

    fn correlation(n: usize) -> CorrelationId {
        CorrelationId::new(format!("chat-{n}"))
    }

    #[test]
    fn test_per_user_limit() {
        let admission = controller(2, 5);
        let owner = UserId::new(1);

        let _first = admission.try_acquire(owner, &correlation(1)).unwrap();
        let _second = admission.try_acquire(owner, &correlation(2)).unwrap();
        let third = admission.try_acquire(owner, &correlation(3));

        assert_eq!(
            third.unwrap_err(),
            AdmissionRejection::PerUserLimitExceeded { owner, limit: 2 }
        );
        assert_eq!(admission.slots_held_by(owner), 2);

        // Another user is unaffected
        assert!(admission.try_acquire(UserId::new(2), &correlation(4)).is_ok());
    }

    #[test]
    fn test_global_capacity() {
        let admission = controller(1, 2);

        let _a = admission.try_acquire(UserId::new(1), &correlation(1)).unwrap();
        let _b = admission.try_acquire(UserId::new(2), &correlation(2)).unwrap();
        let rejected = admission.try_acquire(UserId::new(3), &correlation(3));

        assert_eq!(
            rejected.unwrap_err(),
            AdmissionRejection::GlobalCapacityExceeded { capacity: 2 }
        );
        assert!(
            AdmissionRejection::GlobalCapacityExceeded { capacity: 2 }.is_slot_exhausted()
        );
    }

    #[test]
    fn test_low_disk_space_rejects() {
        let config = AdmissionConfig {
            per_user_limit: 2,
            capacity_factor: 5,
            min_free_space: GIB,
        };
        let admission =
            AdmissionController::new(config, "/tmp", Arc::new(FixedDiskSpace::new(GIB - 1)));

        let result = admission.try_acquire(UserId::new(1), &correlation(1));

        assert_eq!(
            result.unwrap_err(),
            AdmissionRejection::LowDiskSpace {
                available: GIB - 1,
                required: GIB
            }
        );
        assert_eq!(admission.active_slots(), 0);
    }

    #[test]
    fn test_failing_disk_probe_fails_closed() {
        let config = AdmissionConfig::default();
        let admission = AdmissionController::new(config, "/tmp", Arc::new(FixedDiskSpace::failing()));

        let result = admission.try_acquire(UserId::new(1), &correlation(1));
        assert!(matches!(
            result,
            Err(AdmissionRejection::StorageUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_acquire_checks_disk() {
        let config = AdmissionConfig {
            per_user_limit: 2,
            capacity_factor: 5,
            min_free_space: GIB,
        };
        let short = AdmissionController::new(
            config.clone(),
            "/tmp",
            Arc::new(FixedDiskSpace::new(GIB - 1)),
        );
        let roomy = AdmissionController::new(config, "/tmp", Arc::new(FixedDiskSpace::new(GIB)));

        let rejected = short.acquire(UserId::new(1), &correlation(1)).await;
        let admitted = roomy.acquire(UserId::new(1), &correlation(1)).await;

        assert!(matches!(rejected, Err(AdmissionRejection::LowDiskSpace { .. })));
        assert_eq!(admitted.unwrap().slot().owner, UserId::new(1));
        assert_eq!(short.active_slots(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let admission = controller(1, 1);
        let owner = UserId::new(9);

        {
            let guard = admission.try_acquire(owner, &correlation(1)).unwrap();
            assert_eq!(guard.slot().owner, owner);
            assert_eq!(admission.active_slots(), 1);
        }

        assert_eq!(admission.active_slots(), 0);
        assert!(admission.try_acquire(owner, &correlation(2)).is_ok());
    }

    #[test]
    fn test_release_is_idempotent() {
        let admission = controller(2, 2);
        let owner = UserId::new(1);
        let guard = admission.try_acquire(owner, &correlation(1)).unwrap();
        let id = guard.slot().id;

        assert!(admission.release(id));
        assert!(!admission.release(id));
        assert!(!admission.release(SlotId(12345)));

        // Drop after an explicit release must not touch a newer slot
        let newer = admission.try_acquire(owner, &correlation(2)).unwrap();
        drop(guard);
        assert_eq!(admission.active_slots(), 1);
        assert_eq!(admission.slots()[0].id, newer.slot().id);
    }

    #[test]
    fn test_concurrent_acquire_respects_limits() {
        let admission = controller(2, 3);
        let owners: Vec<UserId> = (0..4).map(UserId::new).collect();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let admission = admission.clone();
                let owners = owners.clone();
                scope.spawn(move || {
                    for round in 0..500 {
                        let owner = owners[(worker + round) % owners.len()];
                        if let Ok(guard) = admission.try_acquire(owner, &correlation(round)) {
                            assert!(admission.slots_held_by(owner) <= 2);
                            assert!(admission.active_slots() <= 6);
                            drop(guard);
                        }
                    }
                });
            }
        });

        assert_eq!(admission.active_slots(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(i64),
        Release(usize),
        ReleaseUnknown(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..4).prop_map(Op::Acquire),
            (0usize..16).prop_map(Op::Release),
            (1000u64..2000).prop_map(Op::ReleaseUnknown),
        ]
    }

    proptest! {
        #[test]
        fn test_slot_counts_never_exceed_limits(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let admission = controller(2, 3);
            let mut held: Vec<SlotGuard> = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Acquire(owner) => {
                        if let Ok(guard) = admission.try_acquire(UserId::new(owner), &correlation(step)) {
                            held.push(guard);
                        }
                    }
                    Op::Release(index) if !held.is_empty() => {
                        let guard = held.remove(index % held.len());
                        // Explicit release followed by drop must free exactly one slot
                        admission.release(guard.slot().id);
                        drop(guard);
                    }
                    Op::Release(_) => {}
                    Op::ReleaseUnknown(id) => {
                        prop_assert!(!admission.release(SlotId(id)));
                    }
                }

                prop_assert_eq!(admission.active_slots(), held.len());
                prop_assert!(admission.active_slots() <= 6);
                for owner in 0..4 {
                    prop_assert!(admission.slots_held_by(UserId::new(owner)) <= 2);
                }
            }
        }
    }
}
