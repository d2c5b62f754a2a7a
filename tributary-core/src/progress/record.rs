//! Display-oriented progress records.

use std::time::Duration;

use super::Direction;
use crate::format::{format_bytes, format_duration, format_rate};

const UNKNOWN_ETA: &str = "unknown";

/// Human-readable view of a transfer at the last accepted sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub file_name: String,
    pub direction: Direction,
    pub current: String,
    pub total: String,
    pub speed: String,
    pub percent: f64,
    pub elapsed: String,
    pub eta: String,
}

impl ProgressRecord {
    /// Derives a record from raw byte counts and the time since start.
    ///
    /// The ETA is the estimated time remaining at the average speed so far;
    /// it reads `unknown` until any bytes have moved, and when the estimate
    /// does not fit in a [`Duration`].
    pub fn compute(
        file_name: &str,
        direction: Direction,
        current: u64,
        total: u64,
        elapsed: Duration,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let speed = if elapsed_secs > 0.0 {
            current as f64 / elapsed_secs
        } else {
            0.0
        };

        let remaining = if speed > 0.0 && total >= current {
            Duration::try_from_secs_f64((total - current) as f64 / speed).ok()
        } else if total > 0 && current >= total {
            Some(Duration::ZERO)
        } else {
            None
        };
        let eta = remaining.map_or_else(|| UNKNOWN_ETA.to_string(), format_duration);

        Self {
            file_name: file_name.to_string(),
            direction,
            current: format_bytes(current),
            total: format_bytes(total),
            speed: format_rate(speed),
            percent: percent(current, total),
            elapsed: format_duration(elapsed),
            eta,
        }
    }

    /// Multi-line summary shown when the requester asks for progress.
    pub fn summary(&self) -> String {
        format!(
            "Progress Details...\n\nCompleted : {}\nTotal Size : {}\nSpeed : {}\nProgress : {:.2}%\nElapsed Time : {}\nETA: {}",
            self.current, self.total, self.speed, self.percent, self.elapsed, self.eta
        )
    }
}

/// Completion percentage; zero when the total is unknown.
pub fn percent(current: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        current as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_megabyte_record() {
        let record = ProgressRecord::compute(
            "movie.mkv",
            Direction::Download,
            512_000,
            1_048_576,
            Duration::from_secs(2),
        );

        assert!((record.percent - 48.83).abs() < 0.01);
        assert_eq!(record.current, "500.00 KB");
        assert_eq!(record.total, "1.00 MB");
        assert_eq!(record.speed, "250.00 KB/s");
        assert_eq!(record.elapsed, "2s");
        // 536576 remaining bytes at 256000 B/s
        assert_eq!(record.eta, "2s, 96ms");
    }

    #[test]
    fn test_record_without_elapsed_time() {
        let record = ProgressRecord::compute("a.mp4", Direction::Upload, 0, 100, Duration::ZERO);
        assert_eq!(record.eta, "unknown");
        assert_eq!(record.speed, "0.00 B/s");
        assert_eq!(record.percent, 0.0);
    }

    #[test]
    fn test_unrepresentable_eta_is_unknown() {
        let record = ProgressRecord::compute(
            "huge.mkv",
            Direction::Download,
            1,
            u64::MAX,
            Duration::from_secs(u64::MAX / 2),
        );
        assert_eq!(record.eta, "unknown");
        assert_eq!(record.current, "1.00 B");
    }

    #[test]
    fn test_completed_record() {
        let record =
            ProgressRecord::compute("a.mp4", Direction::Upload, 100, 100, Duration::from_secs(1));
        assert_eq!(record.percent, 100.0);
        assert_eq!(record.eta, "0ms");
    }

    #[test]
    fn test_percent_with_unknown_total() {
        assert_eq!(percent(10, 0), 0.0);
    }

    #[test]
    fn test_summary_layout() {
        let record = ProgressRecord::compute(
            "movie.mkv",
            Direction::Download,
            512_000,
            1_048_576,
            Duration::from_secs(2),
        );
        let summary = record.summary();

        assert!(summary.contains("Completed : 500.00 KB"));
        assert!(summary.contains("Progress : 48.83%"));
    }
}
