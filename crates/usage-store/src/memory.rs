//! In-memory usage store
//!
//! Keeps usage buckets and throttle events in process memory. Readiness can
//! be toggled so callers' not-ready paths are exercisable.
//!
//! Memory stays bounded in a long-running process: writing a window drops
//! that account's buckets which ended at or before the new window's start,
//! and only the newest `MAX_THROTTLE_EVENTS` throttle events are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{ThrottleEventRecord, UsageDelta, UsageFuture, UsageSnapshot, UsageStore};

type WindowKey = (String, u64, u64);

/// Throttle events retained; older ones are dropped first.
pub const MAX_THROTTLE_EVENTS: usize = 1024;

/// Usage store backed by process memory.
pub struct MemoryUsageStore {
    ready: AtomicBool,
    windows: Mutex<HashMap<WindowKey, UsageSnapshot>>,
    throttle_events: Mutex<VecDeque<(i64, ThrottleEventRecord)>>,
    next_event_id: AtomicI64,
}

impl MemoryUsageStore {
    /// Create an empty store that reports ready.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            windows: Mutex::new(HashMap::new()),
            throttle_events: Mutex::new(VecDeque::new()),
            next_event_id: AtomicI64::new(1),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Retained throttle events with their ids, oldest first.
    pub async fn throttle_events(&self) -> Vec<(i64, ThrottleEventRecord)> {
        self.throttle_events.lock().await.iter().cloned().collect()
    }

    /// Number of distinct usage windows held.
    pub async fn window_count(&self) -> usize {
        self.windows.lock().await.len()
    }
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStore for MemoryUsageStore {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn get_account_usage_in_window<'a>(
        &'a self,
        account_id: &'a str,
        window_start: u64,
        window_end: u64,
    ) -> UsageFuture<'a, UsageSnapshot> {
        Box::pin(async move {
            let windows = self.windows.lock().await;
            let key = (account_id.to_string(), window_start, window_end);
            Ok(windows.get(&key).copied().unwrap_or_default())
        })
    }

    fn upsert_account_usage_window<'a>(
        &'a self,
        account_id: &'a str,
        window_start: u64,
        window_end: u64,
        delta: UsageDelta,
    ) -> UsageFuture<'a, ()> {
        Box::pin(async move {
            let mut windows = self.windows.lock().await;
            let before = windows.len();
            windows.retain(|(id, _, end), _| id != account_id || *end > window_start);
            let pruned = before - windows.len();
            if pruned > 0 {
                debug!(account_id, pruned, "expired usage windows dropped");
            }
            windows
                .entry((account_id.to_string(), window_start, window_end))
                .or_default()
                .accumulate(&delta);
            debug!(
                account_id,
                window_start,
                tokens = delta.total_tokens(),
                "usage window updated"
            );
            Ok(())
        })
    }

    fn insert_throttle_event(&self, event: ThrottleEventRecord) -> UsageFuture<'_, i64> {
        Box::pin(async move {
            let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
            debug!(
                event_id = id,
                account_id = %event.account_id,
                error_type = %event.error_type,
                "throttle event recorded"
            );
            let mut events = self.throttle_events.lock().await;
            events.push_back((id, event));
            if events.len() > MAX_THROTTLE_EVENTS {
                events.pop_front();
            }
            Ok(id)
        })
    }
}
