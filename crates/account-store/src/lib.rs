//! Persistent account store for the account pool
//!
//! Holds the pool's single persisted document: account profiles, session
//! assignments, the switch configuration, and round-robin rotation state.
//! The document is read and written whole; the registry in `account-pool`
//! owns all mutation logic.
//!
//! Document keys:
//! - `accounts`: id → profile, in insertion order
//! - `assignments`: session id → assignment
//! - `switchConfig`: switching behaviour singleton
//! - `rotationOrder` / `rotationIndex`: round-robin cursor

pub mod document;
pub mod error;
pub mod store;

pub use document::{
    AccountAssignment, AccountPatch, AccountProfile, AccountStatus, AccountSwitchConfig,
    DEFAULT_AGENT_TYPE, DEFAULT_AUTH_METHOD, PoolDocument, RotationState, SelectionStrategy,
    SwitchConfigPatch,
};
pub use error::{Error, Result};
pub use store::{AccountStore, JsonFileStore, MemoryStore, StoreFuture};
