//! Pool notifications and the sinks that carry them
//!
//! Every event maps to one named channel (`account:*`). Sinks are
//! fire-and-forget: `send` never blocks and never reports failure back to
//! the pool.

use std::sync::Arc;

use account_store::AccountStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Which path flipped a throttled account back to active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveredBy {
    Poller,
    UsageListener,
}

impl RecoveredBy {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveredBy::Poller => "poller",
            RecoveredBy::UsageListener => "usage-listener",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub account_id: String,
    pub account_name: String,
    pub old_status: AccountStatus,
    pub new_status: AccountStatus,
    pub recovered_by: RecoveredBy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAvailable {
    pub recovered_account_ids: Vec<String>,
    pub recovered_count: usize,
    pub still_throttled_count: usize,
    pub total_accounts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Throttled {
    pub account_id: String,
    pub account_name: String,
    pub session_id: String,
    pub reason: String,
    pub auto_switch_available: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_alternatives: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPrompt {
    pub session_id: String,
    pub from_account_id: String,
    pub from_account_name: String,
    pub to_account_id: String,
    pub to_account_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchExecute {
    pub session_id: String,
    pub from_account_id: String,
    pub to_account_id: String,
    pub automatic: bool,
}

/// Running usage for the account's current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdate {
    pub account_id: String,
    pub session_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    /// 0 when the account has no limit
    pub limit_tokens: u64,
    /// `None` when the account has no limit
    pub usage_percent: Option<f64>,
    pub window_start: u64,
    pub window_end: u64,
    pub query_count: u64,
    pub cost_usd: f64,
}

/// Payload shared by the warning and limit-reached channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitAlert {
    pub account_id: String,
    pub account_name: String,
    pub session_id: String,
    pub usage_percent: f64,
    pub threshold_percent: f64,
    pub total_tokens: u64,
    pub limit_tokens: u64,
    pub window_end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assigned {
    pub session_id: String,
    pub account_id: String,
    pub account_name: String,
    pub automatic: bool,
}

/// A notification emitted by the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "payload")]
pub enum AccountEvent {
    #[serde(rename = "account:status-changed")]
    StatusChanged(StatusChanged),
    #[serde(rename = "account:recovery-available")]
    RecoveryAvailable(RecoveryAvailable),
    #[serde(rename = "account:throttled")]
    Throttled(Throttled),
    #[serde(rename = "account:switch-prompt")]
    SwitchPrompt(SwitchPrompt),
    #[serde(rename = "account:switch-execute")]
    SwitchExecute(SwitchExecute),
    #[serde(rename = "account:usage-update")]
    UsageUpdate(UsageUpdate),
    #[serde(rename = "account:limit-warning")]
    LimitWarning(LimitAlert),
    #[serde(rename = "account:limit-reached")]
    LimitReached(LimitAlert),
    #[serde(rename = "account:assigned")]
    Assigned(Assigned),
}

impl AccountEvent {
    /// Channel name this event is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            AccountEvent::StatusChanged(_) => "account:status-changed",
            AccountEvent::RecoveryAvailable(_) => "account:recovery-available",
            AccountEvent::Throttled(_) => "account:throttled",
            AccountEvent::SwitchPrompt(_) => "account:switch-prompt",
            AccountEvent::SwitchExecute(_) => "account:switch-execute",
            AccountEvent::UsageUpdate(_) => "account:usage-update",
            AccountEvent::LimitWarning(_) => "account:limit-warning",
            AccountEvent::LimitReached(_) => "account:limit-reached",
            AccountEvent::Assigned(_) => "account:assigned",
        }
    }

    /// The event's payload as camelCase JSON.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            AccountEvent::StatusChanged(p) => serde_json::to_value(p),
            AccountEvent::RecoveryAvailable(p) => serde_json::to_value(p),
            AccountEvent::Throttled(p) => serde_json::to_value(p),
            AccountEvent::SwitchPrompt(p) => serde_json::to_value(p),
            AccountEvent::SwitchExecute(p) => serde_json::to_value(p),
            AccountEvent::UsageUpdate(p) => serde_json::to_value(p),
            AccountEvent::LimitWarning(p) | AccountEvent::LimitReached(p) => {
                serde_json::to_value(p)
            }
            AccountEvent::Assigned(p) => serde_json::to_value(p),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Fire-and-forget event delivery.
pub trait EventSink: Send + Sync {
    fn send(&self, event: AccountEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn send(&self, event: AccountEvent) {
        info!(channel = event.channel(), payload = %event.payload(), "account event");
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Events sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<AccountEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn send(&self, event: AccountEvent) {
        let channel = event.channel();
        if self.tx.send(event).is_err() {
            debug!(channel, "no event subscribers, dropping");
        }
    }
}

/// Delivers each event to every inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn send(&self, event: AccountEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.send(event.clone());
            }
            last.send(event);
        }
    }
}
