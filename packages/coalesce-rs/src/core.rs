//! Core types for coalescing actions.
//!
//! # Overview
//!
//! An action turns an input into a [`Work`] stream: zero or more values
//! followed by exactly one terminal event. Callers never see the raw stream;
//! they see [`ActionEvent`]s, where the terminal event is either
//! [`ActionEvent::Completed`] or [`ActionEvent::Failed`].
//!
//! # Identity
//!
//! Every execution and every subscriber gets a UUID-backed id. Ids are only
//! used for bookkeeping and diagnostics; they carry no ordering.

use std::fmt;

use futures::stream::BoxStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ActionError;
use crate::property::Property;

/// One run of the wrapped asynchronous operation.
///
/// `Ok` items are values. An `Err` item, or the end of the stream, is the
/// terminal event; anything after an `Err` is never polled.
pub type Work<O, E> = BoxStream<'static, Result<O, E>>;

// =============================================================================
// Ids
// =============================================================================

/// Identifies one execution of the underlying work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Create a new random execution id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExecutionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one caller's interest in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new random subscriber id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriberId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Action Event
// =============================================================================

/// An event observed by a caller of an action.
///
/// A well-formed sequence is `Value*` followed by exactly one of
/// `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent<O, E> {
    /// The work produced a value.
    Value(O),
    /// The work finished successfully.
    Completed,
    /// The work did not finish successfully.
    Failed(ActionError<E>),
}

impl<O, E> ActionEvent<O, E> {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionEvent::Value(_))
    }

    /// Borrow the value, if this is a `Value` event.
    pub fn value(&self) -> Option<&O> {
        match self {
            ActionEvent::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Take the value, if this is a `Value` event.
    pub fn into_value(self) -> Option<O> {
        match self {
            ActionEvent::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the error, if this is a `Failed` event.
    pub fn error(&self) -> Option<&ActionError<E>> {
        match self {
            ActionEvent::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Short name of the event kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionEvent::Value(_) => "value",
            ActionEvent::Completed => "completed",
            ActionEvent::Failed(ActionError::Disabled) => "disabled",
            ActionEvent::Failed(ActionError::Failed(_)) => "failed",
            ActionEvent::Failed(ActionError::Cancelled) => "cancelled",
            ActionEvent::Failed(ActionError::Timeout { .. }) => "timeout",
        }
    }
}

// =============================================================================
// Action Protocol
// =============================================================================

/// The contract shared by plain and coalescing actions.
///
/// UI glue binds against this trait: it feeds inputs to [`apply`], drives
/// "busy" indicators from [`is_executing`], toggles controls from
/// [`is_enabled`], and reports results from [`values`] and [`errors`].
///
/// [`apply`]: ActionProtocol::apply
/// [`is_executing`]: ActionProtocol::is_executing
/// [`is_enabled`]: ActionProtocol::is_enabled
/// [`values`]: ActionProtocol::values
/// [`errors`]: ActionProtocol::errors
pub trait ActionProtocol: Send + Sync {
    /// Input accepted by `apply`.
    type Input;
    /// Values produced by the work.
    type Output: Clone + Send + 'static;
    /// Domain error produced by the work.
    type Error: Clone + Send + 'static;
    /// What a caller gets back from `apply`.
    type Execution: Send;

    /// Start (or join) an execution with the given input.
    fn apply(&self, input: Self::Input) -> Self::Execution;

    /// True while an execution is unresolved.
    fn is_executing(&self) -> Property<bool>;

    /// True while `apply` would be accepted.
    fn is_enabled(&self) -> Property<bool>;

    /// Every value produced by every execution, from now on.
    fn values(&self) -> broadcast::Receiver<Self::Output>;

    /// Every work error produced by every execution, from now on.
    fn errors(&self) -> broadcast::Receiver<Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        let value: ActionEvent<u32, String> = ActionEvent::Value(1);
        assert!(!value.is_terminal());
        assert!(ActionEvent::<u32, String>::Completed.is_terminal());
        assert!(ActionEvent::<u32, String>::Failed(ActionError::Disabled).is_terminal());
    }

    #[test]
    fn test_event_accessors() {
        let value: ActionEvent<u32, String> = ActionEvent::Value(7);
        assert_eq!(value.value(), Some(&7));
        assert!(value.error().is_none());
        assert_eq!(value.into_value(), Some(7));

        let failed: ActionEvent<u32, String> =
            ActionEvent::Failed(ActionError::Failed("boom".into()));
        assert!(failed.value().is_none());
        assert_eq!(
            failed.error(),
            Some(&ActionError::Failed("boom".to_string()))
        );
    }

    #[test]
    fn test_event_kind_distinguishes_disabled_from_failure() {
        let disabled: ActionEvent<(), String> = ActionEvent::Failed(ActionError::Disabled);
        let failed: ActionEvent<(), String> = ActionEvent::Failed(ActionError::Failed("x".into()));
        assert_eq!(disabled.kind(), "disabled");
        assert_eq!(failed.kind(), "failed");
    }

    #[test]
    fn test_ids_are_unique_and_display_as_uuid() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.into_inner().to_string());

        let uuid = Uuid::new_v4();
        assert_eq!(SubscriberId::from(uuid).into_inner(), uuid);
    }
}
