//! Midnight-anchored usage windows
//!
//! A day is cut into fixed-size buckets of `window_ms` starting at local
//! midnight. Every consumer derives the same `(start, end)` for a given
//! instant without coordinating. A timestamp exactly on a boundary belongs to
//! the later bucket. The last bucket of a day may run past the next midnight.

use chrono::{DateTime, Local, NaiveTime, TimeZone, Timelike};

/// Window length used when an account doesn't configure one (5 hours).
pub const DEFAULT_TOKEN_WINDOW_MS: u64 = 5 * 60 * 60 * 1000;

/// Resolve an account's configured window, where 0 means "use the default".
pub fn effective_window_ms(token_window_ms: u64) -> u64 {
    if token_window_ms > 0 {
        token_window_ms
    } else {
        DEFAULT_TOKEN_WINDOW_MS
    }
}

/// Bucket bounds (unix millis) containing `now`, anchored to midnight in
/// `now`'s timezone.
pub fn window_bounds<Tz: TimeZone>(now: &DateTime<Tz>, window_ms: u64) -> (u64, u64) {
    let window_ms = window_ms.max(1);
    let now_ms = now.timestamp_millis().max(0) as u64;
    let day_start = day_start_millis(now).min(now_ms);
    let index = (now_ms - day_start) / window_ms;
    let start = day_start + index * window_ms;
    (start, start.saturating_add(window_ms))
}

/// Bucket bounds for a unix-millis instant in the host's local timezone.
pub fn local_window_bounds(now_ms: u64, window_ms: u64) -> (u64, u64) {
    if let Some(now) = Local.timestamp_millis_opt(now_ms as i64).single() {
        return window_bounds(&now, window_ms);
    }
    let now = DateTime::from_timestamp_millis(now_ms as i64).unwrap_or_default();
    window_bounds(&now, window_ms)
}

fn day_start_millis<Tz: TimeZone>(now: &DateTime<Tz>) -> u64 {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    let millis = match now.timezone().from_local_datetime(&midnight).earliest() {
        Some(start) => start.timestamp_millis(),
        // Midnight skipped by a DST jump; fall back to wall-clock offset
        None => {
            now.timestamp_millis()
                - i64::from(now.num_seconds_from_midnight()) * 1000
                - i64::from(now.timestamp_subsec_millis())
        }
    };
    millis.max(0) as u64
}
