use chrono::Utc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Format a `Duration` as a human-readable string with automatic unit scaling.
///
/// Produces output like `1.94ms`, `2.34s`, `150.00µs` using Rust's Debug format.
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Log a warning if the elapsed time since `start` exceeds `threshold`.
pub fn log_if_slow(start: Instant, threshold: Duration, label: &str) {
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(duration = fmt_duration(elapsed), "slow operation: {label}");
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn unix_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
