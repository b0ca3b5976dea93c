//! Error taxonomy for coalescing actions.
//!
//! `ActionError` keeps three outcomes apart that callers must be able to
//! tell from each other when unwrapping a result:
//!
//! - [`ActionError::Failed`]: the work itself terminated with a domain error.
//!   Every handle attached to that execution receives it.
//! - [`ActionError::Disabled`]: `start` was called while the action was
//!   disabled. No work ran.
//! - [`ActionError::Cancelled`]: this handle detached before a terminal
//!   event reached it. Other handles on the same execution are unaffected.
//!
//! [`ActionError::Timeout`] is produced only by caller-level helpers such as
//! [`Subscription::result_timeout`](crate::Subscription::result_timeout).
//!
//! None of these are retried by the library. To retry, call `start` again.
//!
//! # Example
//!
//! ```ignore
//! match handle.result().await {
//!     Ok(Some(profile)) => render(profile),
//!     Ok(None) => render_empty(),
//!     Err(ActionError::Disabled) => show_hint("refresh is turned off"),
//!     Err(ActionError::Failed(e)) => show_error(e),
//!     Err(ActionError::Cancelled) | Err(ActionError::Timeout { .. }) => {}
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type shared across executions when work reports `anyhow` errors.
///
/// `anyhow::Error` is not `Clone`, and every attached handle needs its own
/// copy of the failure.
pub type SharedError = Arc<anyhow::Error>;

/// Why an action did not produce a successful terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError<E> {
    /// `start` was attempted while the action was disabled.
    #[error("action is disabled")]
    Disabled,

    /// The work terminated with a domain error.
    #[error("action failed: {0}")]
    Failed(E),

    /// The handle detached before a terminal event reached it.
    #[error("cancelled before a result was produced")]
    Cancelled,

    /// A caller-level timeout expired while waiting on a handle.
    #[error("timed out after {duration:?}")]
    Timeout {
        /// How long the caller waited.
        duration: Duration,
    },
}

impl<E> ActionError<E> {
    /// Returns true for [`ActionError::Disabled`].
    pub fn is_disabled(&self) -> bool {
        matches!(self, ActionError::Disabled)
    }

    /// Returns true for [`ActionError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActionError::Cancelled)
    }

    /// Returns true for [`ActionError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, ActionError::Timeout { .. })
    }

    /// Borrow the domain error, if the work failed.
    pub fn failure(&self) -> Option<&E> {
        match self {
            ActionError::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Take the domain error, if the work failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            ActionError::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Map the domain error, keeping every other variant as is.
    pub fn map_failure<F, T>(self, f: F) -> ActionError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            ActionError::Disabled => ActionError::Disabled,
            ActionError::Failed(e) => ActionError::Failed(f(e)),
            ActionError::Cancelled => ActionError::Cancelled,
            ActionError::Timeout { duration } => ActionError::Timeout { duration },
        }
    }
}
