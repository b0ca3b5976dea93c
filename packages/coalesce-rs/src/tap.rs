//! Action taps: observe execution events without influencing them.
//!
//! Taps are for logging, analytics and metrics around a coalescing action.
//! They see every event the coordinator delivers, regardless of how many
//! handles are attached.
//!
//! # Execution Order
//!
//! ```text
//! Work
//!  → Gate (queued for every handle)
//!  → Taps   ← here (spawned, fire-and-forget)
//! ```
//!
//! Handles never wait on taps, and a failing tap is logged and ignored.
//! Taps are spawned per event, so two events of the same execution may be
//! observed out of order by slow taps. Use [`TapContext::sequence`] if order
//! matters.
//!
//! # Example
//!
//! ```ignore
//! use coalesce::{ActionEvent, ActionTap, TapContext};
//!
//! struct RefreshMetrics {
//!     client: StatsdClient,
//! }
//!
//! #[async_trait]
//! impl ActionTap<Feed, ApiError> for RefreshMetrics {
//!     async fn on_event(&self, event: ActionEvent<Feed, ApiError>, ctx: TapContext) -> Result<()> {
//!         if event.is_terminal() {
//!             self.client.incr(&format!("feed.refresh.{}", event.kind())).await?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::core::{ActionEvent, ExecutionId};

/// Context provided to action taps.
#[derive(Debug, Clone, Copy)]
pub struct TapContext {
    /// The execution that produced the event.
    pub execution: ExecutionId,
    /// Position of the event within its execution, starting at 0.
    pub sequence: u64,
    /// Handles the event was delivered to.
    pub subscribers: usize,
    /// When the event was delivered.
    pub timestamp: Instant,
}

/// Observer of every event a coalescing action delivers.
#[async_trait]
pub trait ActionTap<O, E>: Send + Sync + 'static {
    /// Called for each delivered event.
    ///
    /// Errors are logged but do not affect delivery.
    async fn on_event(&self, event: ActionEvent<O, E>, ctx: TapContext) -> Result<()>;
}

struct TapRunner<O, E> {
    tap: Arc<dyn ActionTap<O, E>>,
    name: &'static str,
}

impl<O, E> Clone for TapRunner<O, E> {
    fn clone(&self) -> Self {
        Self {
            tap: self.tap.clone(),
            name: self.name,
        }
    }
}

/// Registered taps of one coordinator.
pub(crate) struct TapRegistry<O, E> {
    taps: Vec<TapRunner<O, E>>,
}

impl<O, E> Default for TapRegistry<O, E> {
    fn default() -> Self {
        Self { taps: Vec::new() }
    }
}

impl<O, E> TapRegistry<O, E> {
    pub(crate) fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.taps.len()
    }
}

impl<O, E> TapRegistry<O, E>
where
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn register<T: ActionTap<O, E>>(&mut self, tap: T) {
        self.taps.push(TapRunner {
            tap: Arc::new(tap),
            name: std::any::type_name::<T>(),
        });
    }

    /// Spawn every tap for `event`.
    pub(crate) fn run_all(&self, event: &ActionEvent<O, E>, ctx: TapContext) {
        for runner in &self.taps {
            let runner = runner.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.tap.on_event(event, ctx).await {
                    warn!(
                        tap = runner.name,
                        execution = %ctx.execution,
                        error = %e,
                        "tap failed"
                    );
                }
            });
        }
    }
}
