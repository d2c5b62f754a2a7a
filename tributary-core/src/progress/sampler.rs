//! Rate limiting for progress samples.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Accepts at most one sample per interval, plus the final one.
///
/// The first sample is always accepted so a transfer shows up in the status
/// message as soon as bytes start moving.
#[derive(Debug)]
pub struct ProgressSampler {
    interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl ProgressSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: Mutex::new(None),
        }
    }

    /// Decides whether the sample taken at `now` should be recorded.
    pub fn accept(&self, current: u64, total: u64, now: Instant) -> bool {
        let mut last = self.last_accepted.lock();
        let completed = total > 0 && current >= total;
        let due = match *last {
            None => true,
            Some(previous) => now.saturating_duration_since(previous) >= self.interval,
        };

        if completed || due {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_rate_limited() {
        let sampler = ProgressSampler::new(Duration::from_secs(5));
        let start = Instant::now();

        assert!(sampler.accept(10, 100, start));
        assert!(!sampler.accept(20, 100, start + Duration::from_secs(1)));
        assert!(!sampler.accept(30, 100, start + Duration::from_secs(4)));
        assert!(sampler.accept(40, 100, start + Duration::from_secs(5)));
        assert!(!sampler.accept(50, 100, start + Duration::from_secs(6)));
    }

    #[test]
    fn test_completion_always_accepted() {
        let sampler = ProgressSampler::new(Duration::from_secs(5));
        let start = Instant::now();

        assert!(sampler.accept(10, 100, start));
        assert!(sampler.accept(100, 100, start + Duration::from_millis(10)));
    }

    #[test]
    fn test_unknown_total_is_never_complete() {
        let sampler = ProgressSampler::new(Duration::from_secs(5));
        let start = Instant::now();

        assert!(sampler.accept(0, 0, start));
        assert!(!sampler.accept(10, 0, start + Duration::from_millis(10)));
    }
}
