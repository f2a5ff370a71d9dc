//! Account registry: CRUD, assignments, default resolution, and selection
//!
//! The registry owns every mutation of the pool document. Each call loads the
//! whole document from the `AccountStore`, mutates it in memory, and writes it
//! back while holding an async mutex, so calls within one process never
//! interleave mid-mutation.
//!
//! Unknown ids are tolerated: lookups return `None`, mutators no-op. Stale ids
//! from benign races (an account removed between lookup and mutation) must
//! never fail the caller. The only domain error is `DuplicateEmail` from `add`
//! and `update`.

use std::sync::Arc;

use account_store::{
    AccountAssignment, AccountPatch, AccountProfile, AccountStatus, AccountStore,
    AccountSwitchConfig, DEFAULT_AGENT_TYPE, DEFAULT_AUTH_METHOD, PoolDocument, RotationState,
    SelectionStrategy, SwitchConfigPatch,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Input for registering an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub config_dir: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub auth_method: Option<String>,
}

impl NewAccount {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        config_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            config_dir: config_dir.into(),
            agent_type: None,
            auth_method: None,
        }
    }

    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn auth_method(mut self, auth_method: impl Into<String>) -> Self {
        self.auth_method = Some(auth_method.into());
        self
    }
}

/// Account counts for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub accounts_total: usize,
    pub accounts_active: usize,
    pub accounts_throttled: usize,
    pub accounts_expired: usize,
    pub accounts_disabled: usize,
    pub assignments_total: usize,
}

impl PoolSummary {
    /// All active → healthy, some active → degraded, none (or empty) → unhealthy.
    pub fn status(&self) -> &'static str {
        if self.accounts_total > 0 && self.accounts_active == self.accounts_total {
            "healthy"
        } else if self.accounts_active > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

/// Registry of pooled accounts backed by an `AccountStore`.
pub struct AccountRegistry {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn AccountStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// The clock every pool timestamp is taken from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a new account.
    ///
    /// The first account added to an empty pool becomes the default. Fails
    /// with `DuplicateEmail` if the email (case-insensitive) is taken.
    pub async fn add(&self, account: NewAccount) -> Result<AccountProfile> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;

        if let Some(existing) = doc
            .accounts
            .values()
            .find(|p| p.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(Error::DuplicateEmail {
                email: account.email,
                existing_id: existing.id.clone(),
            });
        }

        let profile = AccountProfile {
            id: uuid::Uuid::new_v4().to_string(),
            name: account.name,
            email: account.email,
            config_dir: account.config_dir,
            agent_type: account
                .agent_type
                .unwrap_or_else(|| DEFAULT_AGENT_TYPE.to_string()),
            auth_method: account
                .auth_method
                .unwrap_or_else(|| DEFAULT_AUTH_METHOD.to_string()),
            status: AccountStatus::Active,
            added_at: self.clock.now_millis(),
            last_used_at: 0,
            last_throttled_at: 0,
            token_limit_per_window: 0,
            token_window_ms: 0,
            is_default: doc.accounts.is_empty(),
            auto_switch_enabled: true,
        };

        doc.accounts.insert(profile.id.clone(), profile.clone());
        doc.rotation_order.push(profile.id.clone());
        self.store.save(&doc).await?;

        info!(
            account_id = %profile.id,
            email = %profile.email,
            is_default = profile.is_default,
            "account added to pool"
        );
        Ok(profile)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AccountProfile>> {
        let doc = self.store.load().await?;
        Ok(doc.accounts.get(id).cloned())
    }

    /// All accounts in insertion order.
    pub async fn get_all(&self) -> Result<Vec<AccountProfile>> {
        let doc = self.store.load().await?;
        Ok(doc.accounts.into_values().collect())
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<AccountProfile>> {
        let doc = self.store.load().await?;
        Ok(doc
            .accounts
            .into_values()
            .find(|p| p.email.eq_ignore_ascii_case(email)))
    }

    pub async fn find_by_config_dir(&self, config_dir: &str) -> Result<Option<AccountProfile>> {
        let doc = self.store.load().await?;
        Ok(doc.accounts.into_values().find(|p| p.config_dir == config_dir))
    }

    /// Apply a partial update. Returns `None` if the account is unknown.
    ///
    /// Setting `is_default` clears the flag on every other account first.
    /// Changing the email to one held by another account fails with
    /// `DuplicateEmail`.
    pub async fn update(&self, id: &str, patch: AccountPatch) -> Result<Option<AccountProfile>> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;

        if !doc.accounts.contains_key(id) {
            debug!(account_id = id, "update for unknown account ignored");
            return Ok(None);
        }

        if let Some(email) = &patch.email
            && let Some(existing) = doc
                .accounts
                .values()
                .find(|p| p.id != id && p.email.eq_ignore_ascii_case(email))
        {
            return Err(Error::DuplicateEmail {
                email: email.clone(),
                existing_id: existing.id.clone(),
            });
        }

        if patch.is_default == Some(true) {
            for (other_id, profile) in doc.accounts.iter_mut() {
                if other_id != id {
                    profile.is_default = false;
                }
            }
        }

        let updated = match doc.accounts.get_mut(id) {
            Some(profile) => {
                patch.apply_to(profile);
                profile.clone()
            }
            None => return Ok(None),
        };
        self.store.save(&doc).await?;

        debug!(account_id = id, "account updated");
        Ok(Some(updated))
    }

    /// Remove an account, its rotation entry, and every assignment to it.
    ///
    /// Returns false if the account is unknown.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;

        if doc.accounts.shift_remove(id).is_none() {
            return Ok(false);
        }
        doc.rotation_order.retain(|rid| rid != id);
        let before = doc.assignments.len();
        doc.assignments.retain(|_, a| a.account_id != id);
        let dropped = before - doc.assignments.len();
        self.store.save(&doc).await?;

        info!(
            account_id = id,
            assignments_dropped = dropped,
            "account removed from pool"
        );
        Ok(true)
    }

    /// Set an account's status. Throttling also stamps `last_throttled_at`.
    pub async fn set_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        let now = self.clock.now_millis();
        self.modify_account(id, |profile| {
            profile.status = status;
            if status == AccountStatus::Throttled {
                profile.last_throttled_at = now;
            }
        })
        .await?;
        Ok(())
    }

    /// Reactivate a throttled account if `ready` holds for its stored state.
    ///
    /// The check and the write happen in one load-modify-save under the
    /// registry lock, so a throttle recorded after the caller's own read is
    /// never overwritten. Returns whether the account was reactivated.
    pub async fn recover_if<F>(&self, id: &str, ready: F) -> Result<bool>
    where
        F: FnOnce(&AccountProfile) -> bool,
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;
        let Some(profile) = doc.accounts.get_mut(id) else {
            debug!(account_id = id, "recovery for unknown account ignored");
            return Ok(false);
        };
        if profile.status != AccountStatus::Throttled || !ready(profile) {
            return Ok(false);
        }
        profile.status = AccountStatus::Active;
        self.store.save(&doc).await?;
        Ok(true)
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<()> {
        let now = self.clock.now_millis();
        self.modify_account(id, |profile| profile.last_used_at = now)
            .await?;
        Ok(())
    }

    /// Bind a session to an account, replacing any prior binding.
    pub async fn assign_to_session(
        &self,
        session_id: &str,
        account_id: &str,
    ) -> Result<AccountAssignment> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;
        let now = self.clock.now_millis();

        let assignment = AccountAssignment {
            session_id: session_id.to_string(),
            account_id: account_id.to_string(),
            assigned_at: now,
        };
        let previous = doc
            .assignments
            .insert(session_id.to_string(), assignment.clone());
        if let Some(profile) = doc.accounts.get_mut(account_id) {
            profile.last_used_at = now;
        }
        self.store.save(&doc).await?;

        info!(
            session_id,
            account_id,
            previous_account_id = previous.as_ref().map(|a| a.account_id.as_str()),
            "session assigned"
        );
        Ok(assignment)
    }

    pub async fn get_assignment(&self, session_id: &str) -> Result<Option<AccountAssignment>> {
        let doc = self.store.load().await?;
        Ok(doc.assignments.get(session_id).cloned())
    }

    /// Returns false if the session had no assignment.
    pub async fn remove_assignment(&self, session_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;
        if doc.assignments.remove(session_id).is_none() {
            return Ok(false);
        }
        self.store.save(&doc).await?;
        debug!(session_id, "assignment removed");
        Ok(true)
    }

    pub async fn get_all_assignments(&self) -> Result<Vec<AccountAssignment>> {
        let doc = self.store.load().await?;
        Ok(doc.assignments.into_values().collect())
    }

    /// The explicit default if it is active, else the first active account.
    pub async fn get_default_account(&self) -> Result<Option<AccountProfile>> {
        let doc = self.store.load().await?;
        let explicit = doc
            .accounts
            .values()
            .find(|p| p.is_default && p.status == AccountStatus::Active);
        let chosen = explicit.or_else(|| {
            doc.accounts
                .values()
                .find(|p| p.status == AccountStatus::Active)
        });
        Ok(chosen.cloned())
    }

    /// Pick the next account to fail over to.
    ///
    /// Candidates are active, auto-switch enabled, and not in `exclude_ids`.
    /// The choice is not reserved; callers assign it immediately.
    pub async fn select_next_account(
        &self,
        exclude_ids: &[String],
    ) -> Result<Option<AccountProfile>> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;

        let candidates: Vec<AccountProfile> = doc
            .accounts
            .values()
            .filter(|p| {
                p.status == AccountStatus::Active
                    && p.auto_switch_enabled
                    && !exclude_ids.iter().any(|x| x == &p.id)
            })
            .cloned()
            .collect();

        let Some(first) = candidates.first() else {
            debug!(excluded = exclude_ids.len(), "no selectable accounts");
            return Ok(None);
        };

        let chosen = match doc.switch_config.selection_strategy {
            SelectionStrategy::RoundRobin => {
                let candidate_ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
                let mut rotation = doc.rotation();
                match advance_rotation(&mut rotation, &candidate_ids) {
                    Some(next_id) => {
                        doc.set_rotation(rotation);
                        self.store.save(&doc).await?;
                        candidates
                            .iter()
                            .find(|c| c.id == next_id)
                            .unwrap_or(first)
                            .clone()
                    }
                    None => first.clone(),
                }
            }
            SelectionStrategy::LeastUsed => candidates
                .iter()
                .min_by_key(|c| c.last_used_at)
                .unwrap_or(first)
                .clone(),
        };

        debug!(
            account_id = %chosen.id,
            strategy = ?doc.switch_config.selection_strategy,
            candidates = candidates.len(),
            "selected next account"
        );
        Ok(Some(chosen))
    }

    pub async fn get_switch_config(&self) -> Result<AccountSwitchConfig> {
        let doc = self.store.load().await?;
        Ok(doc.switch_config)
    }

    /// Merge `patch` into the switch config and return the result.
    pub async fn update_switch_config(
        &self,
        patch: SwitchConfigPatch,
    ) -> Result<AccountSwitchConfig> {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;
        patch.apply_to(&mut doc.switch_config);
        self.store.save(&doc).await?;
        info!(config = ?doc.switch_config, "switch config updated");
        Ok(doc.switch_config)
    }

    /// Counts per status for the health endpoint.
    pub async fn summary(&self) -> Result<PoolSummary> {
        let doc = self.store.load().await?;
        Ok(summarize(&doc))
    }

    /// Load, mutate one account, save. No-op (and no write) if unknown.
    async fn modify_account<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut AccountProfile),
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.store.load().await?;
        match doc.accounts.get_mut(id) {
            Some(profile) => f(profile),
            None => {
                debug!(account_id = id, "mutation for unknown account ignored");
                return Ok(false);
            }
        }
        self.store.save(&doc).await?;
        Ok(true)
    }
}

/// Step the round-robin cursor over the ids in `candidates`.
///
/// The rotation order is filtered to candidates, the cursor advanced by one
/// modulo the filtered length, and the id at the new position returned.
/// Returns `None` when no candidate appears in the rotation order.
fn advance_rotation(rotation: &mut RotationState, candidates: &[&str]) -> Option<String> {
    let order: Vec<&String> = rotation
        .order
        .iter()
        .filter(|id| candidates.contains(&id.as_str()))
        .collect();
    if order.is_empty() {
        return None;
    }
    let next = (rotation.index % order.len() + 1) % order.len();
    let id = order[next].clone();
    rotation.index = next;
    Some(id)
}

fn summarize(doc: &PoolDocument) -> PoolSummary {
    let mut summary = PoolSummary {
        accounts_total: doc.accounts.len(),
        assignments_total: doc.assignments.len(),
        ..Default::default()
    };
    for profile in doc.accounts.values() {
        match profile.status {
            AccountStatus::Active => summary.accounts_active += 1,
            AccountStatus::Throttled => summary.accounts_throttled += 1,
            AccountStatus::Expired => summary.accounts_expired += 1,
            AccountStatus::Disabled => summary.accounts_disabled += 1,
        }
    }
    summary
}
