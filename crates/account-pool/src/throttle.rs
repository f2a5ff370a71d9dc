//! Reaction to provider rate-limit signals
//!
//! When an upstream reports that an account is throttled, the handler
//! records the event against the account's current usage window, marks the
//! account throttled, and decides whether a failover should be offered to the
//! user, executed automatically, or is impossible.
//!
//! The handler runs in event-listener context with no error channel back to
//! the signal source, so `handle` never fails: every error is logged with
//! session and account context and dropped.

use std::sync::Arc;

use account_store::{AccountProfile, AccountStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use usage_store::{ThrottleEventRecord, UsageStore, effective_window_ms, local_window_bounds};

use crate::error::Result;
use crate::events::{AccountEvent, EventSink, SwitchExecute, SwitchPrompt, Throttled};
use crate::registry::AccountRegistry;

/// A provider rate-limit signal attributed to one session and account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleSignal {
    pub session_id: String,
    pub account_id: String,
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
}

/// Outcome of a throttle, after the account was marked throttled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchDecision {
    /// Switching is turned off in the switch config
    Disabled,
    /// No other account can take over
    NoAlternatives,
    /// The user is asked to confirm a switch to `to_account_id`
    Prompt { to_account_id: String },
    /// The session should move to `to_account_id` without asking
    Execute { to_account_id: String },
}

impl SwitchDecision {
    pub fn label(&self) -> &'static str {
        match self {
            SwitchDecision::Disabled => "disabled",
            SwitchDecision::NoAlternatives => "none",
            SwitchDecision::Prompt { .. } => "prompt",
            SwitchDecision::Execute { .. } => "execute",
        }
    }
}

pub struct ThrottleHandler {
    registry: Arc<AccountRegistry>,
    usage: Arc<dyn UsageStore>,
    events: Arc<dyn EventSink>,
}

impl ThrottleHandler {
    pub fn new(
        registry: Arc<AccountRegistry>,
        usage: Arc<dyn UsageStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            usage,
            events,
        }
    }

    /// Handle a throttle signal. Never fails; errors are logged.
    ///
    /// Returns the switch decision when the throttle was recorded, `None`
    /// when the flow stopped early (unknown account, store not ready, error).
    pub async fn handle(&self, signal: &ThrottleSignal) -> Option<SwitchDecision> {
        match self.try_handle(signal).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    session_id = %signal.session_id,
                    account_id = %signal.account_id,
                    error_type = %signal.error_type,
                    error = %e,
                    "failed to handle throttle signal"
                );
                None
            }
        }
    }

    async fn try_handle(&self, signal: &ThrottleSignal) -> Result<Option<SwitchDecision>> {
        let Some(account) = self.registry.get(&signal.account_id).await? else {
            debug!(
                account_id = %signal.account_id,
                "throttle signal for unknown account ignored"
            );
            return Ok(None);
        };

        if !self.usage.is_ready() {
            debug!(
                account_id = %account.id,
                "usage store not ready, skipping throttle handling"
            );
            return Ok(None);
        }

        let now = self.registry.clock().now_millis();
        let (window_start, window_end) =
            local_window_bounds(now, effective_window_ms(account.token_window_ms));
        let snapshot = self
            .usage
            .get_account_usage_in_window(&account.id, window_start, window_end)
            .await?;
        let event_id = self
            .usage
            .insert_throttle_event(ThrottleEventRecord {
                account_id: account.id.clone(),
                session_id: signal.session_id.clone(),
                error_type: signal.error_type.clone(),
                total_tokens: snapshot.total_tokens(),
                window_start,
                window_end,
            })
            .await?;
        metrics::counter!(
            "account_pool_throttle_events_total",
            "error_type" => signal.error_type.clone()
        )
        .increment(1);

        self.registry
            .set_status(&account.id, AccountStatus::Throttled)
            .await?;
        info!(
            account_id = %account.id,
            session_id = %signal.session_id,
            error_type = %signal.error_type,
            error_message = %signal.error_message,
            event_id,
            window_tokens = snapshot.total_tokens(),
            "account throttled"
        );

        let decision = self.decide(signal, &account).await?;
        metrics::counter!(
            "account_pool_switch_decisions_total",
            "decision" => decision.label()
        )
        .increment(1);
        Ok(Some(decision))
    }

    async fn decide(
        &self,
        signal: &ThrottleSignal,
        account: &AccountProfile,
    ) -> Result<SwitchDecision> {
        let config = self.registry.get_switch_config().await?;

        if !config.enabled {
            self.events.send(AccountEvent::Throttled(Throttled {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                session_id: signal.session_id.clone(),
                reason: signal.error_type.clone(),
                auto_switch_available: false,
                no_alternatives: false,
            }));
            return Ok(SwitchDecision::Disabled);
        }

        let excluded = [account.id.clone()];
        let Some(next) = self.registry.select_next_account(&excluded).await? else {
            info!(account_id = %account.id, "no alternative account available");
            self.events.send(AccountEvent::Throttled(Throttled {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                session_id: signal.session_id.clone(),
                reason: signal.error_type.clone(),
                auto_switch_available: true,
                no_alternatives: true,
            }));
            return Ok(SwitchDecision::NoAlternatives);
        };

        if config.prompt_before_switch {
            self.events.send(AccountEvent::SwitchPrompt(SwitchPrompt {
                session_id: signal.session_id.clone(),
                from_account_id: account.id.clone(),
                from_account_name: account.name.clone(),
                to_account_id: next.id.clone(),
                to_account_name: next.name.clone(),
                reason: signal.error_type.clone(),
            }));
            Ok(SwitchDecision::Prompt {
                to_account_id: next.id,
            })
        } else {
            info!(
                session_id = %signal.session_id,
                from_account_id = %account.id,
                to_account_id = %next.id,
                "automatic account switch"
            );
            self.events.send(AccountEvent::SwitchExecute(SwitchExecute {
                session_id: signal.session_id.clone(),
                from_account_id: account.id.clone(),
                to_account_id: next.id.clone(),
                automatic: true,
            }));
            Ok(SwitchDecision::Execute {
                to_account_id: next.id,
            })
        }
    }
}
