//! The coalescing coordinator.
//!
//! [`CoalescingAction`] wraps an [`Action`] behind a single-flight gate.
//! Concurrent starts share one execution of the underlying work, and each
//! caller gets its own [`Subscription`] that can be cancelled independently.
//!
//! # Architecture
//!
//! ```text
//! start(input) ──► enabled? ──no──► Subscription (Failed(Disabled))
//!                     │
//!                    yes
//!                     ▼
//!               Gate::admit ──Joined──► Subscription (input discarded)
//!                     │
//!                  Reserved
//!                     ▼
//!        Action::start_execution(input)     (outside the gate lock)
//!                     │
//!                     ▼
//!        tokio::spawn(drive) ──► Gate::deliver ──► queue per handle
//!                                      └──────────► taps
//! ```
//!
//! The driver task owns the work stream. It stops when the work terminates,
//! or when the last handle detaches (the gate drops the driver's cancel
//! signal and the driver drops the stream).

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::action::{Action, Execution};
use crate::core::{ActionEvent, ActionProtocol, ExecutionId, SubscriberId};
use crate::gate::{Admission, Delivered, Gate, InflightInfo};
use crate::property::Property;
use crate::subscription::Subscription;
use crate::tap::{ActionTap, TapContext, TapRegistry};

/// Single-flight wrapper around an [`Action`].
///
/// - While idle, `start(input)` starts the underlying work with `input`.
/// - While executing, `start(input)` joins the live execution; `input` is
///   discarded (first input wins).
/// - A handle sees only events emitted after it attached.
/// - The work is cancelled only when every attached handle has detached.
///
/// Clones share the same gate. Dropping the coordinator does not cancel a
/// live execution; its handles keep it alive.
///
/// `start` spawns the driver with [`tokio::spawn`] and must be called from
/// within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// let refresh = CoalescingAction::new(Action::from_async(|feed: FeedId| async move {
///     api.refresh(feed).await
/// }));
///
/// // Pull-to-refresh and the background timer fire at the same time
/// let from_user = refresh.start(feed_id);
/// let from_timer = refresh.start(feed_id);
///
/// // One request, two results
/// let (a, b) = tokio::join!(from_user.result(), from_timer.result());
/// ```
pub struct CoalescingAction<I, O, E> {
    action: Action<I, O, E>,
    gate: Arc<Gate<O, E>>,
    taps: Arc<TapRegistry<O, E>>,
}

impl<I, O, E> Clone for CoalescingAction<I, O, E> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
            gate: self.gate.clone(),
            taps: self.taps.clone(),
        }
    }
}

impl<I, O, E> CoalescingAction<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Wrap `action` with no taps.
    pub fn new(action: Action<I, O, E>) -> Self {
        Self::builder(action).build()
    }

    /// Start building a coordinator around `action`.
    pub fn builder(action: Action<I, O, E>) -> CoalescingActionBuilder<I, O, E> {
        CoalescingActionBuilder {
            action,
            taps: TapRegistry::default(),
        }
    }

    /// Start the work, or join the execution already in flight.
    ///
    /// Never fails synchronously. If the underlying action is disabled the
    /// returned handle yields a single `Failed(ActionError::Disabled)` and
    /// no work is started.
    pub fn start(&self, input: I) -> Subscription<O, E> {
        let subscriber = SubscriberId::new();

        if !self.action.status().is_enabled_now() {
            debug!(%subscriber, "action is disabled, rejecting start");
            return Subscription::disabled(subscriber);
        }

        match self.gate.admit(subscriber) {
            Admission::Joined {
                execution,
                receiver,
            } => {
                debug!(%execution, %subscriber, "execution already in flight, input discarded");
                Subscription::attached(subscriber, execution, receiver, self.gate.clone())
            }
            Admission::Reserved {
                execution,
                receiver,
                cancelled,
            } => {
                // Built before the work factory runs so a panicking factory
                // still detaches and frees the gate.
                let subscription =
                    Subscription::attached(subscriber, execution, receiver, self.gate.clone());

                let mut run = self.action.start_execution(execution, input);
                if let Some(lease) = run.take_lease() {
                    self.gate.install_lease(execution, lease);
                }

                tokio::spawn(drive(
                    Arc::downgrade(&self.gate),
                    execution,
                    run,
                    cancelled,
                    self.taps.clone(),
                ));

                subscription
            }
        }
    }

    /// True from the moment a start reserves the gate until the gate is idle
    /// again (terminal event delivered, or last handle detached).
    pub fn is_executing(&self) -> Property<bool> {
        self.gate.is_executing()
    }

    /// The underlying action's enabling condition.
    ///
    /// Joining a live execution is always allowed, so this does not turn
    /// false while executing. Use `action().is_enabled()` for the flag that
    /// is also false while the underlying action is busy.
    pub fn is_enabled(&self) -> Property<bool> {
        self.action.enabled_condition()
    }

    /// Enable or disable the underlying action.
    pub fn set_enabled(&self, enabled: bool) {
        self.action.set_enabled(enabled);
    }

    /// Every value produced by the underlying action, from now on.
    pub fn values(&self) -> broadcast::Receiver<O> {
        self.action.values()
    }

    /// Every work error produced by the underlying action, from now on.
    pub fn errors(&self) -> broadcast::Receiver<E> {
        self.action.errors()
    }

    /// Snapshot of the live execution, if any.
    pub fn inflight(&self) -> Option<InflightInfo> {
        self.gate.inflight()
    }

    /// Number of handles attached to the live execution.
    pub fn subscriber_count(&self) -> usize {
        self.gate.subscriber_count()
    }

    /// The wrapped action.
    pub fn action(&self) -> &Action<I, O, E> {
        &self.action
    }
}

impl<I, O, E> ActionProtocol for CoalescingAction<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Input = I;
    type Output = O;
    type Error = E;
    type Execution = Subscription<O, E>;

    fn apply(&self, input: I) -> Subscription<O, E> {
        self.start(input)
    }

    fn is_executing(&self) -> Property<bool> {
        CoalescingAction::is_executing(self)
    }

    fn is_enabled(&self) -> Property<bool> {
        CoalescingAction::is_enabled(self)
    }

    fn values(&self) -> broadcast::Receiver<O> {
        CoalescingAction::values(self)
    }

    fn errors(&self) -> broadcast::Receiver<E> {
        CoalescingAction::errors(self)
    }
}

impl<I, O, E> fmt::Debug for CoalescingAction<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingAction")
            .field("executing", &self.gate.is_executing().get())
            .field("subscribers", &self.gate.subscriber_count())
            .field("taps", &self.taps.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CoalescingAction`].
///
/// # Example
///
/// ```ignore
/// let refresh = CoalescingAction::builder(fetch_feed)
///     .with_tap(RefreshMetrics::new(statsd))
///     .with_tap(AuditLog::default())
///     .build();
/// ```
pub struct CoalescingActionBuilder<I, O, E> {
    action: Action<I, O, E>,
    taps: TapRegistry<O, E>,
}

impl<I, O, E> CoalescingActionBuilder<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Register a tap that observes every delivered event.
    pub fn with_tap<T: ActionTap<O, E>>(mut self, tap: T) -> Self {
        self.taps.register(tap);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> CoalescingAction<I, O, E> {
        CoalescingAction {
            action: self.action,
            gate: Arc::new(Gate::new()),
            taps: Arc::new(self.taps),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Abandons the execution if the driver stops without delivering a terminal
/// event (panic in the work, or task aborted by runtime shutdown).
struct DriverGuard<O, E> {
    gate: Weak<Gate<O, E>>,
    execution: ExecutionId,
}

impl<O, E> Drop for DriverGuard<O, E> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.upgrade() {
            // No-op unless the execution is still live
            gate.abandon(self.execution);
        }
    }
}

async fn drive<O, E>(
    gate: Weak<Gate<O, E>>,
    execution: ExecutionId,
    mut run: Execution<O, E>,
    mut cancelled: oneshot::Receiver<()>,
    taps: Arc<TapRegistry<O, E>>,
) where
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let _guard = DriverGuard {
        gate: gate.clone(),
        execution,
    };
    let mut sequence = 0;

    loop {
        let event = tokio::select! {
            biased;

            _ = &mut cancelled => {
                debug!(%execution, "execution cancelled, dropping work");
                return;
            }
            event = run.next() => event.unwrap_or(ActionEvent::Completed),
        };

        let Some(live) = gate.upgrade() else {
            return;
        };
        let tapped = (!taps.is_empty()).then(|| event.clone());
        let delivered = live.deliver(execution, event);
        drop(live);

        let subscribers = match delivered {
            Delivered::Value { subscribers } | Delivered::Finished { subscribers } => subscribers,
            Delivered::Stale => {
                debug!(%execution, "execution no longer live, dropping work");
                return;
            }
        };

        if let Some(event) = tapped {
            taps.run_all(
                &event,
                TapContext {
                    execution,
                    sequence,
                    subscribers,
                    timestamp: Instant::now(),
                },
            );
        }
        sequence += 1;

        if matches!(delivered, Delivered::Finished { .. }) {
            return;
        }
    }
}
