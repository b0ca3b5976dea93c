//! # Coalesce
//!
//! Single-flight actions for Tokio: many callers, one in-flight execution,
//! independent cancellation.
//!
//! ## Core Concepts
//!
//! - [`Action`] = one input in, one [`Execution`] out. It rejects starts
//!   while busy and does no sharing of its own.
//! - [`CoalescingAction`] = a gate in front of an `Action`. Starts that
//!   arrive while work is in flight join it instead of starting more.
//! - [`Subscription`] = one caller's handle. Each handle can cancel its own
//!   interest; the work is cancelled only when the last handle goes.
//!
//! ## Architecture
//!
//! ```text
//!  caller A ─┐                                   ┌─► Subscription A
//!  caller B ─┼─► CoalescingAction::start ─► Gate ┼─► Subscription B
//!  caller C ─┘            │                 ▲    └─► Subscription C
//!                         │ (idle only)     │ deliver()
//!                         ▼                 │
//!                 Action::start ─► driver task ─► ActionTaps
//!                         │
//!                         └─► values() / errors()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single flight** - At most one execution is live per coordinator
//! 2. **First input wins** - The input of a start that joins is discarded
//! 3. **Reference-counted cancellation** - Detaching a strict subset of
//!    handles never cancels the work; detaching the last one does
//! 4. **Exactly one terminal** - Every handle ends with one `Completed` or
//!    `Failed` event
//! 5. **Fresh after idle** - A start after termination or full cancellation
//!    always begins new work
//!
//! ## Guarantees
//!
//! - **No replay**: a handle sees only events emitted after it attached
//! - **Lossless handles**: every handle attached to an execution receives the
//!   same events, in order, however slowly it reads
//! - **In-memory only**: nothing survives the process
//!
//! ## Example
//!
//! ```ignore
//! use coalesce::{Action, CoalescingAction};
//!
//! let refresh = CoalescingAction::new(Action::from_async(|feed: FeedId| async move {
//!     api.refresh(feed).await
//! }));
//!
//! // Both callers share one request
//! let a = refresh.start(feed_id);
//! let mut b = refresh.start(feed_id);
//!
//! // B loses interest; A still gets the result
//! b.cancel();
//! let feed = a.result().await?;
//! ```

// Core modules
mod action;
mod coalescing;
mod config;
mod core;
mod error;
mod gate;
mod property;
mod subscription;
mod tap;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{ActionEvent, ActionProtocol, ExecutionId, SubscriberId, Work};

// Re-export error types
pub use crate::error::{ActionError, SharedError};

// Re-export observable state
pub use property::{MutableProperty, Property};

// Re-export configuration
pub use config::{CoalesceConfig, DEFAULT_HISTORY_CAPACITY};

// Re-export action types
pub use action::{Action, ActionBuilder, Execution, ExecutionLease};

// Re-export coordinator types (primary entry point)
pub use coalescing::{CoalescingAction, CoalescingActionBuilder};
pub use gate::InflightInfo;
pub use subscription::Subscription;

// Re-export tap types (event observation)
pub use tap::{ActionTap, TapContext};

// Re-export commonly used external types
pub use async_trait::async_trait;
