//! Admission limits seen through the coordinator.

use std::sync::Arc;

use proptest::prelude::*;
use tributary_core::admission::AdmissionController;
use tributary_core::config::AdmissionConfig;
use tributary_core::pipeline::{FailureKind, PipelineState};
use tributary_core::testing::FixedDiskSpace;
use tributary_core::transport::CallbackAction;
use tributary_core::{CorrelationId, UserId};

use crate::common::{Harness, OWNER};

const GIB: u64 = 1024 * 1024 * 1024;

#[tokio::test]
async fn test_per_user_limit_rejects_confirmation() {
    let harness = Harness::with_config(|config| config.admission.per_user_limit = 1);
    let _held = harness
        .coordinator
        .admission()
        .try_acquire(UserId::new(OWNER), &CorrelationId::new("elsewhere"))
        .unwrap();

    let id = harness.submit(10, "movie.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.coordinator.outcome(&id),
        Some(PipelineState::Failed(FailureKind::AdmissionRejected))
    );
    assert!(harness.prompt_text(&id).contains("you already have 1 transfers running"));
    assert_eq!(harness.transport.download_attempts(), 0);
}

#[tokio::test]
async fn test_low_disk_space_starts_nothing() {
    let harness = Harness::with_disk(FixedDiskSpace::new(GIB / 2), |config| {
        config.admission.min_free_space = GIB
    });

    let id = harness.submit(10, "movie.mkv").await;
    harness
        .press(CallbackAction::Proceed {
            correlation_id: id.clone(),
        })
        .await;

    assert_eq!(
        harness.coordinator.outcome(&id),
        Some(PipelineState::Failed(FailureKind::AdmissionRejected))
    );
    assert!(harness.prompt_text(&id).contains("low disk space"));
    assert_eq!(harness.transport.download_attempts(), 0);
    assert_eq!(harness.coordinator.progress().active_count(), 0);
    assert_eq!(harness.coordinator.admission().active_slots(), 0);
}

#[tokio::test]
async fn test_slot_released_after_download() {
    let harness = Harness::with_config(|config| config.admission.per_user_limit = 1);

    let first = harness.staged(10, "a.mkv").await;
    let second = harness.staged(11, "b.mkv").await;

    assert_ne!(first, second);
    assert_eq!(harness.coordinator.admission().active_slots(), 0);
}

proptest! {
    #[test]
    fn test_limits_hold_across_owners(
        per_user_limit in 1usize..4,
        capacity_factor in 1usize..4,
        ops in prop::collection::vec((0i64..5, any::<bool>()), 1..120),
    ) {
        let config = AdmissionConfig {
            per_user_limit,
            capacity_factor,
            min_free_space: 0,
        };
        let capacity = config.global_capacity();
        let admission = AdmissionController::new(config, "/tmp", Arc::new(FixedDiskSpace::new(0)));
        let mut guards = Vec::new();

        for (n, (owner, acquire)) in ops.into_iter().enumerate() {
            let owner = UserId::new(owner);
            if acquire {
                if let Ok(guard) = admission.try_acquire(owner, &CorrelationId::new(format!("p-{n}"))) {
                    guards.push(guard);
                }
            } else if let Some(position) = guards.iter().position(|g| g.slot().owner == owner) {
                guards.swap_remove(position);
            }

            prop_assert!(admission.active_slots() <= capacity);
            prop_assert!(admission.slots_held_by(owner) <= per_user_limit);
            prop_assert_eq!(admission.active_slots(), guards.len());
        }

        drop(guards);
        prop_assert_eq!(admission.active_slots(), 0);
    }
}
