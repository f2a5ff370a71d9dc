//! Pool of upstream agent accounts
//!
//! Tracks registered accounts, binds sessions to them, and reacts to
//! provider throttling by failing sessions over to another account. Usage is
//! aggregated per account into midnight-anchored windows so limits can be
//! reported before they are hit.
//!
//! Account lifecycle:
//! 1. Account registered → status `Active`; the first one becomes the default
//! 2. New session → assigned to the default account (`SessionAssigner`)
//! 3. Provider throttles → `Throttled`, failover prompted or executed
//!    (`ThrottleHandler`)
//! 4. Window plus margin elapses → `Active` again (`RecoveryPoller`), or
//!    sooner if live traffic shows the window has passed (`UsageListener`)
//!
//! All state lives in a single document behind `account_store::AccountStore`;
//! every notification goes out through an `EventSink`.

pub mod assign;
pub mod clock;
pub mod error;
pub mod events;
pub mod recovery;
pub mod registry;
pub mod throttle;
pub mod usage;

pub use assign::SessionAssigner;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use events::{AccountEvent, BroadcastSink, EventSink, FanoutSink, RecoveredBy, TracingSink};
pub use recovery::{DEFAULT_POLL_INTERVAL, RECOVERY_MARGIN_MS, RecoveryPoller};
pub use registry::{AccountRegistry, NewAccount, PoolSummary};
pub use throttle::{SwitchDecision, ThrottleHandler, ThrottleSignal};
pub use usage::{DEFAULT_SESSION_SUFFIX_MARKERS, UsageListener, UsageSignal};
