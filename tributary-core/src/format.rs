//! Human-readable rendering of byte counts and durations.
//!
//! Used by progress records, status reports and user-facing messages. Byte
//! counts use binary steps (1 KB = 1024 bytes) with two decimals.

use std::time::Duration;

const BYTE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

const MILLIS_PER_SECOND: u64 = 1_000;
const SECONDS_PER_MINUTE: u64 = 60;
const MINUTES_PER_HOUR: u64 = 60;
const HOURS_PER_DAY: u64 = 24;

/// Formats a byte count, e.g. `512000` as `500.00 KB` and `1048576` as `1.00 MB`.
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Formats a fractional byte count such as a transfer rate.
///
/// Negative and non-finite inputs render as zero bytes.
pub fn format_bytes_f64(bytes: f64) -> String {
    let mut size = if bytes.is_finite() { bytes.max(0.0) } else { 0.0 };
    let mut unit = 0;

    while size >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2} {}", BYTE_UNITS[unit])
}

/// Formats a transfer rate in bytes per second, e.g. `1.50 MB/s`.
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Formats milliseconds as `1d, 2h, 3m, 4s, 5ms`, omitting zero components.
///
/// A zero duration renders as `0ms`.
pub fn format_duration_ms(milliseconds: u64) -> String {
    let millis = milliseconds % MILLIS_PER_SECOND;
    let total_seconds = milliseconds / MILLIS_PER_SECOND;
    let seconds = total_seconds % SECONDS_PER_MINUTE;
    let total_minutes = total_seconds / SECONDS_PER_MINUTE;
    let minutes = total_minutes % MINUTES_PER_HOUR;
    let total_hours = total_minutes / MINUTES_PER_HOUR;
    let hours = total_hours % HOURS_PER_DAY;
    let days = total_hours / HOURS_PER_DAY;

    let parts: Vec<String> = [
        (days, "d"),
        (hours, "h"),
        (minutes, "m"),
        (seconds, "s"),
        (millis, "ms"),
    ]
    .iter()
    .filter(|(value, _)| *value > 0)
    .map(|(value, suffix)| format!("{value}{suffix}"))
    .collect();

    if parts.is_empty() {
        "0ms".to_string()
    } else {
        parts.join(", ")
    }
}

/// Formats a [`Duration`] with millisecond precision.
pub fn format_duration(duration: Duration) -> String {
    format_duration_ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
