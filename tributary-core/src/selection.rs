//! Selectable streams waiting for the requester's choice.
//!
//! One bucket exists per probed transfer. Every lookup and mutation for a
//! correlation id happens under the store lock, so two racing selections
//! cannot both claim the same bucket.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ids::CorrelationId;
use crate::media::StreamDescriptor;

/// Errors raised by bucket lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("No open selection for {correlation_id}")]
    NotFound { correlation_id: CorrelationId },

    #[error("Stream {index} is not part of the selection for {correlation_id}")]
    UnknownStream {
        correlation_id: CorrelationId,
        index: u32,
    },

    #[error("A selection for {correlation_id} already exists")]
    Duplicate { correlation_id: CorrelationId },
}

impl SelectionError {
    /// Stale or raced selections; expected under normal use.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SelectionError::NotFound { .. } | SelectionError::UnknownStream { .. }
        )
    }
}

/// Lifecycle of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Waiting for a choice
    Open,
    /// One stream is being extracted or uploaded
    Claimed { index: u32 },
    /// Cancelled while claimed; removed once the running stage finishes
    CancelRequested { index: u32 },
}

/// Streams offered for one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionBucket {
    pub correlation_id: CorrelationId,
    pub source_path: PathBuf,
    pub source_name: String,
    streams: BTreeMap<u32, StreamDescriptor>,
    state: BucketState,
    created_at: Instant,
}

impl SelectionBucket {
    pub fn new(
        correlation_id: CorrelationId,
        source_path: PathBuf,
        source_name: impl Into<String>,
        streams: Vec<StreamDescriptor>,
    ) -> Self {
        Self {
            correlation_id,
            source_path,
            source_name: source_name.into(),
            streams: streams.into_iter().map(|s| (s.index, s)).collect(),
            state: BucketState::Open,
            created_at: Instant::now(),
        }
    }

    /// Streams ordered by index.
    pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.values()
    }

    pub fn get(&self, index: u32) -> Option<&StreamDescriptor> {
        self.streams.get(&index)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn state(&self) -> BucketState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Outcome of handing a claimed bucket back.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// Bucket is open again for another choice
    Reopened,
    /// A cancel arrived while claimed; the bucket was removed
    Cancelled(SelectionBucket),
    /// No bucket exists
    Missing,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// Bucket was open and has been removed
    Removed(SelectionBucket),
    /// A stage is running; cancellation applies when it finishes
    Deferred,
    NotFound,
}

/// Shared store of selection buckets keyed by correlation id.
#[derive(Debug, Clone, Default)]
pub struct SelectionStore {
    buckets: Arc<Mutex<HashMap<CorrelationId, SelectionBucket>>>,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly probed bucket.
    ///
    /// # Errors
    ///
    /// - `SelectionError::Duplicate` - A bucket already exists for the id
    pub fn insert(&self, bucket: SelectionBucket) -> Result<(), SelectionError> {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(&bucket.correlation_id) {
            return Err(SelectionError::Duplicate {
                correlation_id: bucket.correlation_id,
            });
        }
        buckets.insert(bucket.correlation_id.clone(), bucket);
        Ok(())
    }

    /// Claims stream `index` for extraction.
    ///
    /// Exactly one of several concurrent claims on the same bucket succeeds.
    ///
    /// # Errors
    ///
    /// - `SelectionError::NotFound` - No bucket, or it is already claimed
    /// - `SelectionError::UnknownStream` - Bucket has no such stream
    pub fn claim(
        &self,
        correlation_id: &CorrelationId,
        index: u32,
    ) -> Result<StreamDescriptor, SelectionError> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .get_mut(correlation_id)
            .filter(|bucket| bucket.state == BucketState::Open)
            .ok_or_else(|| SelectionError::NotFound {
                correlation_id: correlation_id.clone(),
            })?;

        let descriptor = bucket
            .streams
            .get(&index)
            .cloned()
            .ok_or_else(|| SelectionError::UnknownStream {
                correlation_id: correlation_id.clone(),
                index,
            })?;
        bucket.state = BucketState::Claimed { index };
        Ok(descriptor)
    }

    /// Returns a claimed bucket after a failed stage so another stream can
    /// be chosen. A cancel that arrived meanwhile removes the bucket.
    pub fn release(&self, correlation_id: &CorrelationId) -> ReleaseOutcome {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(correlation_id) else {
            return ReleaseOutcome::Missing;
        };

        match bucket.state {
            BucketState::CancelRequested { .. } => buckets
                .remove(correlation_id)
                .map(ReleaseOutcome::Cancelled)
                .unwrap_or(ReleaseOutcome::Missing),
            BucketState::Open | BucketState::Claimed { .. } => {
                bucket.state = BucketState::Open;
                ReleaseOutcome::Reopened
            }
        }
    }

    /// Cancels the selection. Open buckets are removed immediately; claimed
    /// ones are marked and removed when the running stage ends.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> CancelOutcome {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(correlation_id) else {
            return CancelOutcome::NotFound;
        };

        match bucket.state {
            BucketState::Open => buckets
                .remove(correlation_id)
                .map(CancelOutcome::Removed)
                .unwrap_or(CancelOutcome::NotFound),
            BucketState::Claimed { index } => {
                bucket.state = BucketState::CancelRequested { index };
                CancelOutcome::Deferred
            }
            BucketState::CancelRequested { .. } => CancelOutcome::Deferred,
        }
    }

    /// Whether a cancel is pending for a claimed bucket.
    pub fn cancel_requested(&self, correlation_id: &CorrelationId) -> bool {
        self.buckets
            .lock()
            .get(correlation_id)
            .is_some_and(|bucket| matches!(bucket.state, BucketState::CancelRequested { .. }))
    }

    /// Removes a bucket unconditionally.
    pub fn remove(&self, correlation_id: &CorrelationId) -> Option<SelectionBucket> {
        self.buckets.lock().remove(correlation_id)
    }

    pub fn snapshot(&self, correlation_id: &CorrelationId) -> Option<SelectionBucket> {
        self.buckets.lock().get(correlation_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Removes open buckets older than `ttl` and returns them so their
    /// source files can be deleted. Claimed buckets are left alone.
    pub fn purge_expired(&self, ttl: Duration) -> Vec<SelectionBucket> {
        let mut buckets = self.buckets.lock();
        let expired: Vec<CorrelationId> = buckets
            .values()
            .filter(|bucket| bucket.state == BucketState::Open && bucket.age() >= ttl)
            .map(|bucket| bucket.correlation_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|correlation_id| buckets.remove(correlation_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::ids::UserId;
    use crate::media::StreamKind;

    fn stream(index: u32, kind: StreamKind, language: &str) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind,
            codec_name: "aac".to_string(),
            language: language.to_string(),
            source_path: Path::new("/w/movie.mkv").to_path_buf(),
            source_name: "movie.mkv".to_string(),
            requester_id: UserId::new(1),
            requester_name: "Ada".to_string(),
        }
    }

    fn store_with_bucket(id: &CorrelationId) -> SelectionStore {
        let store = SelectionStore::new();
        store
            .insert(SelectionBucket::new(
                id.clone(),
                PathBuf::from("/w/movie.mkv"),
                "movie.mkv",
                vec![
                    stream(1, StreamKind::Audio, "eng"),
                    stream(2, StreamKind::Subtitle, "spa"),
                ],
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_claim_is_exclusive() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        let first = store.claim(&id, 1).unwrap();
        assert_eq!(first.language, "eng");

        let second = store.claim(&id, 2).unwrap_err();
        assert!(second.is_not_found());
        assert_eq!(
            store.snapshot(&id).unwrap().state(),
            BucketState::Claimed { index: 1 }
        );
    }

    #[test]
    fn test_unknown_index() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        assert_eq!(
            store.claim(&id, 7).unwrap_err(),
            SelectionError::UnknownStream {
                correlation_id: id.clone(),
                index: 7
            }
        );
        // A bad index leaves the bucket open
        assert!(store.claim(&id, 2).is_ok());
    }

    #[test]
    fn test_release_reopens() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        store.claim(&id, 1).unwrap();
        assert_eq!(store.release(&id), ReleaseOutcome::Reopened);
        assert!(store.claim(&id, 2).is_ok());
    }

    #[test]
    fn test_cancel_open_bucket() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        let outcome = store.cancel(&id);
        assert!(matches!(outcome, CancelOutcome::Removed(ref bucket) if bucket.len() == 2));
        assert!(store.is_empty());
        assert_eq!(store.cancel(&id), CancelOutcome::NotFound);
    }

    #[test]
    fn test_cancel_while_claimed_is_deferred() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        store.claim(&id, 1).unwrap();
        assert_eq!(store.cancel(&id), CancelOutcome::Deferred);
        assert!(store.cancel_requested(&id));
        assert!(store.claim(&id, 2).unwrap_err().is_not_found());

        assert!(matches!(store.release(&id), ReleaseOutcome::Cancelled(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let id = CorrelationId::new("1-1");
        let store = store_with_bucket(&id);

        let result = store.insert(SelectionBucket::new(
            id.clone(),
            PathBuf::from("/w/other.mkv"),
            "other.mkv",
            Vec::new(),
        ));
        assert!(matches!(result, Err(SelectionError::Duplicate { .. })));
    }

    #[test]
    fn test_purge_expired_skips_claimed() {
        let open = CorrelationId::new("1-1");
        let claimed = CorrelationId::new("1-2");
        let store = store_with_bucket(&open);
        store
            .insert(SelectionBucket::new(
                claimed.clone(),
                PathBuf::from("/w/b.mkv"),
                "b.mkv",
                vec![stream(1, StreamKind::Audio, "eng")],
            ))
            .unwrap();
        store.claim(&claimed, 1).unwrap();

        let purged = store.purge_expired(Duration::ZERO);

        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].correlation_id, open);
        assert!(store.snapshot(&claimed).is_some());
        assert!(store.purge_expired(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        for _ in 0..50 {
            let id = CorrelationId::new("1-1");
            let store = store_with_bucket(&id);

            let results: Vec<Result<StreamDescriptor, SelectionError>> =
                std::thread::scope(|scope| {
                    let handles: Vec<_> = (0..4)
                        .map(|n| {
                            let store = store.clone();
                            let id = id.clone();
                            scope.spawn(move || store.claim(&id, 1 + n % 2))
                        })
                        .collect();
                    handles.into_iter().map(|h| h.join().unwrap()).collect()
                });

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(
                results
                    .iter()
                    .filter_map(|r| r.as_ref().err())
                    .all(SelectionError::is_not_found)
            );
        }
    }
}
