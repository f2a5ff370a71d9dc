//! Persisted pool document
//!
//! The whole pool state lives in one JSON document: the account map, the
//! session assignments, the switch configuration singleton, and the
//! round-robin rotation state. Stores read and write it as a single value.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default agent type for accounts added without one.
pub const DEFAULT_AGENT_TYPE: &str = "claude-code";

/// Default auth method for accounts added without one.
pub const DEFAULT_AUTH_METHOD: &str = "oauth";

/// Lifecycle status of a pooled account.
///
/// Transitions:
/// - Active → Throttled (provider rate limit reported)
/// - Throttled → Active (window elapsed, recovered by poller or live usage)
/// - any → Expired / Disabled (set by an operator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Throttled,
    Expired,
    Disabled,
}

impl AccountStatus {
    /// Status label for logging and health output.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Throttled => "throttled",
            AccountStatus::Expired => "expired",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// A registered upstream account.
///
/// Timestamps are unix milliseconds; `0` means "never".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub config_dir: String,
    pub agent_type: String,
    pub auth_method: String,
    pub status: AccountStatus,
    pub added_at: u64,
    pub last_used_at: u64,
    pub last_throttled_at: u64,
    /// Token budget per usage window, 0 for unlimited
    #[serde(default)]
    pub token_limit_per_window: u64,
    /// Usage window length in milliseconds, 0 for the pool default
    #[serde(default)]
    pub token_window_ms: u64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub auto_switch_enabled: bool,
}

/// Partial update for an account. `None` fields are left untouched.
///
/// The id is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub config_dir: Option<String>,
    pub agent_type: Option<String>,
    pub auth_method: Option<String>,
    pub status: Option<AccountStatus>,
    pub last_used_at: Option<u64>,
    pub last_throttled_at: Option<u64>,
    pub token_limit_per_window: Option<u64>,
    pub token_window_ms: Option<u64>,
    pub is_default: Option<bool>,
    pub auto_switch_enabled: Option<bool>,
}

impl AccountPatch {
    /// Apply every present field to `profile`.
    pub fn apply_to(&self, profile: &mut AccountProfile) {
        if let Some(ref name) = self.name {
            profile.name = name.clone();
        }
        if let Some(ref email) = self.email {
            profile.email = email.clone();
        }
        if let Some(ref config_dir) = self.config_dir {
            profile.config_dir = config_dir.clone();
        }
        if let Some(ref agent_type) = self.agent_type {
            profile.agent_type = agent_type.clone();
        }
        if let Some(ref auth_method) = self.auth_method {
            profile.auth_method = auth_method.clone();
        }
        if let Some(status) = self.status {
            profile.status = status;
        }
        if let Some(at) = self.last_used_at {
            profile.last_used_at = at;
        }
        if let Some(at) = self.last_throttled_at {
            profile.last_throttled_at = at;
        }
        if let Some(limit) = self.token_limit_per_window {
            profile.token_limit_per_window = limit;
        }
        if let Some(window) = self.token_window_ms {
            profile.token_window_ms = window;
        }
        if let Some(is_default) = self.is_default {
            profile.is_default = is_default;
        }
        if let Some(enabled) = self.auto_switch_enabled {
            profile.auto_switch_enabled = enabled;
        }
    }
}

/// Binding of one session to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAssignment {
    pub session_id: String,
    pub account_id: String,
    pub assigned_at: u64,
}

/// How the registry picks the next account on failover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastUsed,
}

/// Pool-wide switching behaviour (singleton).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSwitchConfig {
    pub enabled: bool,
    pub prompt_before_switch: bool,
    pub auto_switch_threshold_percent: f64,
    pub warning_threshold_percent: f64,
    pub selection_strategy: SelectionStrategy,
}

impl Default for AccountSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt_before_switch: true,
            auto_switch_threshold_percent: 95.0,
            warning_threshold_percent: 80.0,
            selection_strategy: SelectionStrategy::LeastUsed,
        }
    }
}

/// Partial switch config update with merge semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchConfigPatch {
    pub enabled: Option<bool>,
    pub prompt_before_switch: Option<bool>,
    pub auto_switch_threshold_percent: Option<f64>,
    pub warning_threshold_percent: Option<f64>,
    pub selection_strategy: Option<SelectionStrategy>,
}

impl SwitchConfigPatch {
    pub fn apply_to(&self, config: &mut AccountSwitchConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(prompt) = self.prompt_before_switch {
            config.prompt_before_switch = prompt;
        }
        if let Some(threshold) = self.auto_switch_threshold_percent {
            config.auto_switch_threshold_percent = threshold;
        }
        if let Some(threshold) = self.warning_threshold_percent {
            config.warning_threshold_percent = threshold;
        }
        if let Some(strategy) = self.selection_strategy {
            config.selection_strategy = strategy;
        }
    }
}

/// Round-robin cursor state: account ids in insertion order plus the
/// index of the last account handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationState {
    pub order: Vec<String>,
    pub index: usize,
}

/// The whole persisted pool state.
///
/// `accounts` keeps insertion order so "first active account" is stable
/// across loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolDocument {
    pub accounts: IndexMap<String, AccountProfile>,
    pub assignments: HashMap<String, AccountAssignment>,
    pub switch_config: AccountSwitchConfig,
    pub rotation_order: Vec<String>,
    pub rotation_index: usize,
}

impl PoolDocument {
    /// Snapshot of the rotation fields.
    pub fn rotation(&self) -> RotationState {
        RotationState {
            order: self.rotation_order.clone(),
            index: self.rotation_index,
        }
    }

    /// Replace the rotation fields.
    pub fn set_rotation(&mut self, rotation: RotationState) {
        self.rotation_order = rotation.order;
        self.rotation_index = rotation.index;
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> AccountProfile {
        AccountProfile {
            id: id.into(),
            name: format!("Account {id}"),
            email: format!("{id}@example.com"),
            config_dir: format!("/home/dev/.claude-{id}"),
            agent_type: DEFAULT_AGENT_TYPE.into(),
            auth_method: DEFAULT_AUTH_METHOD.into(),
            status: AccountStatus::Active,
            added_at: 1_700_000_000_000,
            last_used_at: 0,
            last_throttled_at: 0,
            token_limit_per_window: 0,
            token_window_ms: 0,
            is_default: false,
            auto_switch_enabled: true,
        }
    }

    #[test]
    fn document_serializes_with_store_keys() {
        let mut doc = PoolDocument::default();
        doc.accounts.insert("a".into(), profile("a"));
        doc.rotation_order.push("a".into());

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("accounts").is_some());
        assert!(json.get("assignments").is_some());
        assert!(json.get("switchConfig").is_some());
        assert_eq!(json["rotationOrder"], serde_json::json!(["a"]));
        assert_eq!(json["rotationIndex"], 0);
        assert_eq!(json["accounts"]["a"]["status"], "active");
        assert_eq!(json["accounts"]["a"]["configDir"], "/home/dev/.claude-a");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let doc: PoolDocument = serde_json::from_str(r#"{"rotationIndex": 3}"#).unwrap();
        assert!(doc.accounts.is_empty());
        assert_eq!(doc.rotation_index, 3);
        assert_eq!(doc.switch_config, AccountSwitchConfig::default());
    }

    #[test]
    fn accounts_keep_insertion_order_through_json() {
        let mut doc = PoolDocument::default();
        for id in ["zeta", "alpha", "mid"] {
            doc.accounts.insert(id.into(), profile(id));
        }
        let json = serde_json::to_string(&doc).unwrap();
        let back: PoolDocument = serde_json::from_str(&json).unwrap();
        let ids: Vec<&String> = back.accounts.keys().collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn strategy_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(SelectionStrategy::RoundRobin).unwrap(),
            "round-robin"
        );
        assert_eq!(
            serde_json::from_str::<SelectionStrategy>("\"least-used\"").unwrap(),
            SelectionStrategy::LeastUsed
        );
    }

    #[test]
    fn account_patch_only_touches_present_fields() {
        let mut p = profile("a");
        let patch = AccountPatch {
            name: Some("Renamed".into()),
            token_limit_per_window: Some(50_000),
            ..Default::default()
        };
        patch.apply_to(&mut p);
        assert_eq!(p.name, "Renamed");
        assert_eq!(p.token_limit_per_window, 50_000);
        assert_eq!(p.email, "a@example.com");
        assert!(p.auto_switch_enabled);
    }

    #[test]
    fn switch_config_patch_merges() {
        let mut config = AccountSwitchConfig::default();
        let patch: SwitchConfigPatch =
            serde_json::from_str(r#"{"selectionStrategy":"round-robin","enabled":false}"#)
                .unwrap();
        patch.apply_to(&mut config);
        assert!(!config.enabled);
        assert_eq!(config.selection_strategy, SelectionStrategy::RoundRobin);
        assert!(config.prompt_before_switch);
        assert_eq!(config.warning_threshold_percent, 80.0);
    }

    #[test]
    fn missing_auto_switch_flag_defaults_to_enabled() {
        let json = serde_json::json!({
            "id": "a", "name": "A", "email": "a@x.com", "configDir": "/tmp/a",
            "agentType": "claude-code", "authMethod": "oauth", "status": "throttled",
            "addedAt": 1, "lastUsedAt": 0, "lastThrottledAt": 5
        });
        let p: AccountProfile = serde_json::from_value(json).unwrap();
        assert!(p.auto_switch_enabled);
        assert!(!p.is_default);
        assert_eq!(p.status, AccountStatus::Throttled);
    }
}
