//! Usage store abstraction for per-account token accounting
//!
//! Defines the `UsageStore` trait that decouples the account pool from the
//! storage backend holding usage windows and throttle events. The pool
//! computes window bounds (see `window`) and pushes deltas; the store only
//! keeps buckets keyed by `(account_id, window_start, window_end)`.
//!
//! `MemoryUsageStore` is the in-process implementation used by the daemon
//! and by tests.

pub mod memory;
pub mod window;

pub use memory::MemoryUsageStore;
pub use window::{DEFAULT_TOKEN_WINDOW_MS, effective_window_ms, local_window_bounds, window_bounds};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Token and cost deltas from one completed exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
}

impl UsageDelta {
    /// Sum of all four token counters.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_creation_tokens)
    }
}

/// Aggregated usage for one account within one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    /// Number of exchanges folded into this window
    pub query_count: u64,
}

impl UsageSnapshot {
    /// Sum of all four token counters.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_creation_tokens)
    }

    /// Fold one exchange into this window. Counters saturate at `u64::MAX`.
    pub fn accumulate(&mut self, delta: &UsageDelta) {
        self.input_tokens = self.input_tokens.saturating_add(delta.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(delta.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(delta.cache_read_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(delta.cache_creation_tokens);
        self.cost_usd += delta.cost_usd;
        self.query_count = self.query_count.saturating_add(1);
    }
}

/// A throttle occurrence to be recorded for later analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleEventRecord {
    pub account_id: String,
    pub session_id: String,
    pub error_type: String,
    /// Tokens used in the window at the time of the throttle
    pub total_tokens: u64,
    pub window_start: u64,
    pub window_end: u64,
}

/// Errors from usage store backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("usage store not ready")]
    NotReady,

    #[error("usage store backend error: {0}")]
    Backend(String),
}

/// Result alias for usage store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed future returned by store methods, for `Arc<dyn UsageStore>`.
pub type UsageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage for usage windows and throttle events.
///
/// Callers check `is_ready()` before any read or write and abort the whole
/// flow when it is false, so a store that is still opening never sees a
/// partial sequence of writes.
pub trait UsageStore: Send + Sync {
    /// Whether the backend can accept reads and writes.
    fn is_ready(&self) -> bool;

    /// Aggregated usage in the given window; zeroed when the window is absent.
    fn get_account_usage_in_window<'a>(
        &'a self,
        account_id: &'a str,
        window_start: u64,
        window_end: u64,
    ) -> UsageFuture<'a, UsageSnapshot>;

    /// Add `delta` to the window bucket, creating it if absent.
    fn upsert_account_usage_window<'a>(
        &'a self,
        account_id: &'a str,
        window_start: u64,
        window_end: u64,
        delta: UsageDelta,
    ) -> UsageFuture<'a, ()>;

    /// Persist a throttle event and return its id.
    fn insert_throttle_event(&self, event: ThrottleEventRecord) -> UsageFuture<'_, i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accumulates_and_counts_queries() {
        let mut snapshot = UsageSnapshot::default();
        let delta = UsageDelta {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 10,
            cache_creation_tokens: 5,
            cost_usd: 0.25,
        };
        snapshot.accumulate(&delta);
        snapshot.accumulate(&delta);

        assert_eq!(snapshot.total_tokens(), 330);
        assert_eq!(snapshot.query_count, 2);
        assert!((snapshot.cost_usd - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_saturate_instead_of_overflowing() {
        let huge = UsageDelta {
            input_tokens: u64::MAX,
            output_tokens: 1,
            ..Default::default()
        };
        assert_eq!(huge.total_tokens(), u64::MAX);

        let mut snapshot = UsageSnapshot::default();
        snapshot.accumulate(&huge);
        snapshot.accumulate(&huge);
        assert_eq!(snapshot.input_tokens, u64::MAX);
        assert_eq!(snapshot.output_tokens, 2);
        assert_eq!(snapshot.total_tokens(), u64::MAX);
        assert_eq!(snapshot.query_count, 2);
    }

    #[test]
    fn delta_deserializes_partial_camel_case() {
        let delta: UsageDelta =
            serde_json::from_str(r#"{"inputTokens": 12, "costUsd": 0.01}"#).unwrap();
        assert_eq!(delta.input_tokens, 12);
        assert_eq!(delta.output_tokens, 0);
        assert_eq!(delta.total_tokens(), 12);
    }

    #[test]
    fn not_ready_error_message() {
        assert_eq!(Error::NotReady.to_string(), "usage store not ready");
        assert!(
            Error::Backend("disk full".into())
                .to_string()
                .contains("disk full")
        );
    }
}
