//! Per-exchange usage accounting
//!
//! Every completed exchange reports its token counts. The listener folds them
//! into the account's current midnight-anchored window, publishes the running
//! totals, raises advisory limit alerts, and opportunistically reactivates a
//! throttled account whose window has passed.

use std::sync::Arc;

use account_store::{AccountAssignment, AccountStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use usage_store::{UsageDelta, UsageStore, effective_window_ms, local_window_bounds};

use crate::error::Result;
use crate::events::{
    AccountEvent, EventSink, LimitAlert, RecoveredBy, StatusChanged, UsageUpdate,
};
use crate::recovery::window_elapsed;
use crate::registry::AccountRegistry;

/// Suffixes appended to a base session id by multiplexed sessions.
pub const DEFAULT_SESSION_SUFFIX_MARKERS: &[&str] = &["-ai-", "-terminal"];

/// Token usage reported for one completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSignal {
    pub session_id: String,
    pub usage_stats: UsageDelta,
}

pub struct UsageListener {
    registry: Arc<AccountRegistry>,
    usage: Arc<dyn UsageStore>,
    events: Arc<dyn EventSink>,
    suffix_markers: Vec<String>,
}

impl UsageListener {
    pub fn new(
        registry: Arc<AccountRegistry>,
        usage: Arc<dyn UsageStore>,
        events: Arc<dyn EventSink>,
        suffix_markers: Vec<String>,
    ) -> Self {
        Self {
            registry,
            usage,
            events,
            suffix_markers,
        }
    }

    /// Record one exchange's usage. Never fails; errors are logged.
    pub async fn on_usage(&self, signal: &UsageSignal) {
        if let Err(e) = self.try_on_usage(signal).await {
            warn!(
                session_id = %signal.session_id,
                error = %e,
                "failed to record session usage"
            );
        }
    }

    async fn try_on_usage(&self, signal: &UsageSignal) -> Result<()> {
        let Some(assignment) = self.resolve_assignment(&signal.session_id).await? else {
            debug!(
                session_id = %signal.session_id,
                "usage for unassigned session ignored"
            );
            return Ok(());
        };

        let Some(account) = self.registry.get(&assignment.account_id).await? else {
            debug!(
                session_id = %signal.session_id,
                account_id = %assignment.account_id,
                "assigned account no longer exists"
            );
            return Ok(());
        };

        if !self.usage.is_ready() {
            debug!(account_id = %account.id, "usage store not ready, skipping usage");
            return Ok(());
        }

        let now = self.registry.clock().now_millis();
        let window_ms = effective_window_ms(account.token_window_ms);
        let (window_start, window_end) = local_window_bounds(now, window_ms);

        let delta = &signal.usage_stats;
        self.usage
            .upsert_account_usage_window(&account.id, window_start, window_end, *delta)
            .await?;
        metrics::counter!("account_pool_tokens_total", "account_id" => account.id.clone())
            .increment(delta.total_tokens());

        let snapshot = self
            .usage
            .get_account_usage_in_window(&account.id, window_start, window_end)
            .await?;
        let total_tokens = snapshot.total_tokens();
        let limit_tokens = account.token_limit_per_window;
        let usage_percent = (limit_tokens > 0)
            .then(|| (total_tokens as f64 * 100.0 / limit_tokens as f64).min(100.0));

        self.events.send(AccountEvent::UsageUpdate(UsageUpdate {
            account_id: account.id.clone(),
            session_id: signal.session_id.clone(),
            input_tokens: snapshot.input_tokens,
            output_tokens: snapshot.output_tokens,
            cache_read_tokens: snapshot.cache_read_tokens,
            cache_creation_tokens: snapshot.cache_creation_tokens,
            total_tokens,
            limit_tokens,
            usage_percent,
            window_start,
            window_end,
            query_count: snapshot.query_count,
            cost_usd: snapshot.cost_usd,
        }));

        if let Some(percent) = usage_percent {
            let config = self.registry.get_switch_config().await?;
            let alert = |threshold_percent: f64| LimitAlert {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                session_id: signal.session_id.clone(),
                usage_percent: percent,
                threshold_percent,
                total_tokens,
                limit_tokens,
                window_end,
            };
            if percent >= config.auto_switch_threshold_percent {
                info!(
                    account_id = %account.id,
                    usage_percent = percent,
                    "account reached its window limit"
                );
                self.events.send(AccountEvent::LimitReached(alert(
                    config.auto_switch_threshold_percent,
                )));
            } else if percent >= config.warning_threshold_percent {
                debug!(
                    account_id = %account.id,
                    usage_percent = percent,
                    "account nearing its window limit"
                );
                self.events.send(AccountEvent::LimitWarning(alert(
                    config.warning_threshold_percent,
                )));
            }
        }

        if account.status == AccountStatus::Throttled
            && window_elapsed(&account, now, 0)
            && self
                .registry
                .recover_if(&account.id, |current| window_elapsed(current, now, 0))
                .await?
        {
            info!(
                account_id = %account.id,
                session_id = %signal.session_id,
                "live traffic after window end, account active again"
            );
            metrics::counter!(
                "account_pool_recoveries_total",
                "recovered_by" => RecoveredBy::UsageListener.label()
            )
            .increment(1);
            self.events.send(AccountEvent::StatusChanged(StatusChanged {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                old_status: AccountStatus::Throttled,
                new_status: AccountStatus::Active,
                recovered_by: RecoveredBy::UsageListener,
            }));
        }

        self.registry.touch_last_used(&account.id).await?;
        Ok(())
    }

    /// Direct lookup, then one retry under the base id of a compound session.
    async fn resolve_assignment(&self, session_id: &str) -> Result<Option<AccountAssignment>> {
        if let Some(assignment) = self.registry.get_assignment(session_id).await? {
            return Ok(Some(assignment));
        }
        match self.base_session_id(session_id) {
            Some(base) => self.registry.get_assignment(base).await,
            None => Ok(None),
        }
    }

    /// Strip everything from the earliest suffix marker on.
    fn base_session_id<'a>(&self, session_id: &'a str) -> Option<&'a str> {
        self.suffix_markers
            .iter()
            .filter(|m| !m.is_empty())
            .filter_map(|m| session_id.find(m.as_str()))
            .min()
            .filter(|&pos| pos > 0)
            .map(|pos| &session_id[..pos])
    }
}
