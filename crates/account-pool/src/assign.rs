//! Binding sessions to accounts
//!
//! New sessions start on the default account; switches accepted from a
//! prompt, or decided automatically, move an existing session to another
//! account. Both publish `account:assigned`.

use std::sync::Arc;

use account_store::{AccountAssignment, AccountProfile};
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{AccountEvent, Assigned, EventSink};
use crate::registry::AccountRegistry;

pub struct SessionAssigner {
    registry: Arc<AccountRegistry>,
    events: Arc<dyn EventSink>,
}

impl SessionAssigner {
    pub fn new(registry: Arc<AccountRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { registry, events }
    }

    /// Assign a session to the default account, or the first active one when
    /// the default is unusable.
    ///
    /// Returns `None` when no account is active.
    pub async fn assign_default(&self, session_id: &str) -> Result<Option<AccountAssignment>> {
        let Some(account) = self.registry.get_default_account().await? else {
            debug!(session_id, "no active account to assign");
            return Ok(None);
        };
        self.bind(session_id, &account, false).await.map(Some)
    }

    /// Move a session to `to_account_id`. `None` if that account is unknown.
    pub async fn execute_switch(
        &self,
        session_id: &str,
        to_account_id: &str,
        automatic: bool,
    ) -> Result<Option<AccountAssignment>> {
        let Some(account) = self.registry.get(to_account_id).await? else {
            debug!(session_id, to_account_id, "switch target not found");
            return Ok(None);
        };
        let assignment = self.bind(session_id, &account, automatic).await?;
        info!(
            session_id,
            to_account_id,
            automatic,
            "session switched account"
        );
        Ok(Some(assignment))
    }

    async fn bind(
        &self,
        session_id: &str,
        account: &AccountProfile,
        automatic: bool,
    ) -> Result<AccountAssignment> {
        let assignment = self
            .registry
            .assign_to_session(session_id, &account.id)
            .await?;
        self.events.send(AccountEvent::Assigned(Assigned {
            session_id: session_id.to_string(),
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            automatic,
        }));
        Ok(assignment)
    }
}
