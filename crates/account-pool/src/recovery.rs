//! Timer-driven recovery of throttled accounts
//!
//! Runs independently of traffic: every `interval` the poller scans the pool
//! for throttled accounts whose rate-limit window has passed (plus a safety
//! margin to avoid flapping at the boundary) and flips them back to active.
//!
//! The live-traffic path in `usage` can recover the same account without the
//! margin. Both paths converge on `Active`; consumers of
//! `account:status-changed` must treat it as idempotent.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use account_store::{AccountProfile, AccountStatus};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use usage_store::effective_window_ms;

use crate::events::{AccountEvent, EventSink, RecoveredBy, RecoveryAvailable, StatusChanged};
use crate::registry::AccountRegistry;

pub use usage_store::DEFAULT_TOKEN_WINDOW_MS;

/// Extra time past the nominal window before an account is reactivated.
pub const RECOVERY_MARGIN_MS: u64 = 30 * 1000;

/// Default time between recovery scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Whether `profile`'s throttle window plus `margin_ms` has passed at `now`.
pub(crate) fn window_elapsed(profile: &AccountProfile, now: u64, margin_ms: u64) -> bool {
    now.saturating_sub(profile.last_throttled_at) > recovery_threshold_ms(profile, margin_ms)
}

fn recovery_threshold_ms(profile: &AccountProfile, margin_ms: u64) -> u64 {
    effective_window_ms(profile.token_window_ms).saturating_add(margin_ms)
}

enum TaskState {
    Idle,
    /// Claimed by a `start()` that is running its initial poll
    Starting,
    Running(JoinHandle<()>),
}

/// Periodic scanner that reactivates throttled accounts.
pub struct RecoveryPoller {
    registry: Arc<AccountRegistry>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    task: Mutex<TaskState>,
}

impl RecoveryPoller {
    pub fn new(
        registry: Arc<AccountRegistry>,
        events: Arc<dyn EventSink>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            interval: interval.max(Duration::from_millis(1)),
            task: Mutex::new(TaskState::Idle),
        }
    }

    /// Poll once now, then on every interval tick. No-op if already running
    /// or another `start()` is in its initial poll.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut task = self.lock_task();
            if task_active(&task) {
                debug!("recovery poller already running");
                return;
            }
            *task = TaskState::Starting;
        }
        let _claim = StartClaim { poller: self };

        self.poll().await;

        let mut task = self.lock_task();
        if !matches!(*task, TaskState::Starting) {
            debug!("recovery poller stopped during initial poll");
            return;
        }
        let poller = Arc::downgrade(self);
        *task = TaskState::Running(tokio::spawn(run(poller, self.interval)));
        info!(
            interval_secs = self.interval.as_secs_f64(),
            "recovery poller started"
        );
    }

    /// Cancel the timer. Safe to call when not running.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_task(), TaskState::Idle);
        if let TaskState::Running(handle) = previous {
            handle.abort();
            info!("recovery poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        task_active(&self.lock_task())
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one scan and return the ids of recovered accounts.
    pub async fn poll(&self) -> Vec<String> {
        let now = self.registry.clock().now_millis();
        let accounts = match self.registry.get_all().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "recovery poll could not read accounts");
                return Vec::new();
            }
        };

        let throttled_total = accounts
            .iter()
            .filter(|a| a.status == AccountStatus::Throttled)
            .count();

        let mut recovered = Vec::new();
        // last_throttled_at == 0 while throttled is invalid; never recover it
        for account in accounts
            .iter()
            .filter(|a| a.status == AccountStatus::Throttled && a.last_throttled_at > 0)
        {
            let elapsed = now.saturating_sub(account.last_throttled_at);
            if !window_elapsed(account, now, RECOVERY_MARGIN_MS) {
                debug!(
                    account_id = %account.id,
                    remaining_ms = recovery_threshold_ms(account, RECOVERY_MARGIN_MS) - elapsed,
                    "account still inside throttle window"
                );
                continue;
            }

            // Re-checked against the stored state; a throttle recorded since
            // the scan keeps the account throttled
            let recovered_now = self
                .registry
                .recover_if(&account.id, |current| {
                    current.last_throttled_at > 0
                        && window_elapsed(current, now, RECOVERY_MARGIN_MS)
                })
                .await;
            match recovered_now {
                Ok(true) => {}
                Ok(false) => {
                    debug!(account_id = %account.id, "account changed since scan, left as is");
                    continue;
                }
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "failed to reactivate account");
                    continue;
                }
            }

            info!(
                account_id = %account.id,
                throttled_for_secs = elapsed / 1000,
                "throttle window elapsed, account active again"
            );
            metrics::counter!(
                "account_pool_recoveries_total",
                "recovered_by" => RecoveredBy::Poller.label()
            )
            .increment(1);
            self.events.send(AccountEvent::StatusChanged(StatusChanged {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                old_status: AccountStatus::Throttled,
                new_status: AccountStatus::Active,
                recovered_by: RecoveredBy::Poller,
            }));
            recovered.push(account.id.clone());
        }

        self.events
            .send(AccountEvent::RecoveryAvailable(RecoveryAvailable {
                recovered_account_ids: recovered.clone(),
                recovered_count: recovered.len(),
                still_throttled_count: throttled_total - recovered.len(),
                total_accounts: accounts.len(),
            }));

        recovered
    }
}

impl Drop for RecoveryPoller {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner());
        if let TaskState::Running(handle) = std::mem::replace(task, TaskState::Idle) {
            handle.abort();
        }
    }
}

fn task_active(task: &TaskState) -> bool {
    match task {
        TaskState::Idle => false,
        TaskState::Starting => true,
        TaskState::Running(handle) => !handle.is_finished(),
    }
}

/// Releases a `Starting` claim if `start()` is cancelled mid-poll.
struct StartClaim<'a> {
    poller: &'a RecoveryPoller,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        let mut task = self.poller.lock_task();
        if matches!(*task, TaskState::Starting) {
            *task = TaskState::Idle;
        }
    }
}

/// Ticker loop. Holds only a weak reference so dropping the poller ends it.
async fn run(poller: Weak<RecoveryPoller>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; start() already polled
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(poller) = poller.upgrade() else {
            break;
        };
        poller.poll().await;
    }
}
