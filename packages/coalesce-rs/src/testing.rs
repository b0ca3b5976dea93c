//! Testing utilities for actions and coalescing coordinators.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! coalesce = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Driving Work by Hand
//!
//! [`manual_action`] builds an [`Action`] whose work does nothing until the
//! test tells it to. Each start becomes a numbered run that the returned
//! [`WorkController`] can emit into, complete, or fail, and the controller
//! records whether the coordinator dropped (cancelled) the run.
//!
//! ```ignore
//! use coalesce::testing::manual_action;
//!
//! let (action, work) = manual_action::<FeedId, Feed, ApiError>();
//! let refresh = CoalescingAction::new(action);
//!
//! let a = refresh.start(feed_id);
//! let b = refresh.start(other_feed_id);
//! assert_eq!(work.starts(), 1);
//!
//! work.emit(0, feed.clone());
//! work.complete(0);
//! assert_eq!(a.result().await, Ok(Some(feed)));
//! ```
//!
//! # Observing Deliveries
//!
//! [`RecordingTap`] records every event a coordinator delivers, keyed by
//! execution, and lets a test wait until a given number has arrived:
//!
//! ```ignore
//! let recorder = RecordingTap::new();
//! let refresh = CoalescingAction::builder(action)
//!     .with_tap(recorder.clone())
//!     .build();
//!
//! let handle = refresh.start(feed_id);
//! work.emit(0, feed);
//! work.complete(0);
//!
//! recorder.wait_for(2).await;
//! assert_eq!(recorder.events(handle.execution_id().unwrap()).len(), 2);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use tokio::sync::{mpsc, Notify};

use crate::action::Action;
use crate::core::{ActionEvent, ExecutionId};
use crate::tap::{ActionTap, TapContext};

// =============================================================================
// Manual Work
// =============================================================================

struct Run<O, E> {
    sender: Option<mpsc::UnboundedSender<Result<O, E>>>,
    resolved: bool,
    dropped: Arc<AtomicBool>,
}

struct State<I, O, E> {
    inputs: Vec<I>,
    runs: Vec<Run<O, E>>,
}

struct Shared<I, O, E> {
    state: Mutex<State<I, O, E>>,
    notify: Arc<Notify>,
}

/// Flags the run as dropped when the work stream goes away.
struct RunGuard {
    dropped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Build an action whose work is driven by the returned controller.
///
/// Every call to the work factory records its input and opens a new run,
/// numbered from 0 in start order. A run yields only what the controller
/// sends it.
pub fn manual_action<I, O, E>() -> (Action<I, O, E>, WorkController<I, O, E>)
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            inputs: Vec::new(),
            runs: Vec::new(),
        }),
        notify: Arc::new(Notify::new()),
    });

    let factory = shared.clone();
    let action = Action::new(move |input: I| {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(false));

        {
            let mut state = factory.state.lock().unwrap();
            state.inputs.push(input);
            state.runs.push(Run {
                sender: Some(sender),
                resolved: false,
                dropped: dropped.clone(),
            });
        }

        let guard = RunGuard {
            dropped,
            notify: factory.notify.clone(),
        };
        stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            let item = receiver.recv().await?;
            Some((item, (receiver, guard)))
        })
    });

    (action, WorkController { shared })
}

/// Controls the runs of an action built by [`manual_action`].
///
/// Methods taking a `run` index panic if that run has not been started.
pub struct WorkController<I, O, E> {
    shared: Arc<Shared<I, O, E>>,
}

impl<I, O, E> Clone for WorkController<I, O, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<I, O, E> WorkController<I, O, E> {
    fn with_run<R>(&self, run: usize, f: impl FnOnce(&mut Run<O, E>) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap();
        let slot = state
            .runs
            .get_mut(run)
            .unwrap_or_else(|| panic!("run {} was never started", run));
        f(slot)
    }

    /// How many times the work factory was called.
    pub fn starts(&self) -> usize {
        self.shared.state.lock().unwrap().runs.len()
    }

    /// Inputs the work factory was called with, in start order.
    pub fn inputs(&self) -> Vec<I>
    where
        I: Clone,
    {
        self.shared.state.lock().unwrap().inputs.clone()
    }

    /// Emit a value from `run`. Returns false if the run already ended.
    pub fn emit(&self, run: usize, value: O) -> bool {
        self.with_run(run, |slot| match &slot.sender {
            Some(sender) => sender.send(Ok(value)).is_ok(),
            None => false,
        })
    }

    /// Finish `run` successfully.
    pub fn complete(&self, run: usize) {
        self.with_run(run, |slot| {
            if slot.sender.take().is_some() && !slot.dropped.load(Ordering::Acquire) {
                slot.resolved = true;
            }
        });
    }

    /// Finish `run` with `error`.
    pub fn fail(&self, run: usize, error: E) {
        self.with_run(run, |slot| {
            if let Some(sender) = slot.sender.take() {
                if sender.send(Err(error)).is_ok() {
                    slot.resolved = true;
                }
            }
        });
    }

    /// True once the work stream of `run` has been dropped, for any reason.
    pub fn is_dropped(&self, run: usize) -> bool {
        self.with_run(run, |slot| slot.dropped.load(Ordering::Acquire))
    }

    /// True if `run` was dropped before the controller resolved it.
    pub fn is_cancelled(&self, run: usize) -> bool {
        self.with_run(run, |slot| {
            slot.dropped.load(Ordering::Acquire) && !slot.resolved
        })
    }

    /// Wait until the work stream of `run` has been dropped.
    pub async fn dropped(&self, run: usize) {
        loop {
            // Register for notification BEFORE checking
            let notified = self.shared.notify.notified();

            if self.is_dropped(run) {
                return;
            }

            notified.await;
        }
    }
}

// =============================================================================
// Recording Tap
// =============================================================================

/// One event as seen by a [`RecordingTap`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<O, E> {
    pub execution: ExecutionId,
    pub sequence: u64,
    pub subscribers: usize,
    pub event: ActionEvent<O, E>,
}

struct Recorded<O, E> {
    deliveries: Mutex<Vec<Delivery<O, E>>>,
    notify: Notify,
}

/// A tap that records every delivered event.
///
/// Clones share the same record, so a test keeps one clone and registers
/// the other. Taps run on spawned tasks; wait with [`wait_for`](Self::wait_for)
/// under a timeout rather than sleeping.
pub struct RecordingTap<O, E> {
    recorded: Arc<Recorded<O, E>>,
}

impl<O, E> Clone for RecordingTap<O, E> {
    fn clone(&self) -> Self {
        Self {
            recorded: self.recorded.clone(),
        }
    }
}

impl<O, E> Default for RecordingTap<O, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, E> RecordingTap<O, E> {
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Recorded {
                deliveries: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Number of events recorded so far, across executions.
    pub fn len(&self) -> usize {
        self.recorded.deliveries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events have been recorded.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.recorded.notify.notified();

            if self.len() >= count {
                return;
            }

            notified.await;
        }
    }
}

impl<O: Clone, E: Clone> RecordingTap<O, E> {
    /// Everything recorded for `execution`, in delivery order.
    pub fn deliveries(&self, execution: ExecutionId) -> Vec<Delivery<O, E>> {
        let mut deliveries: Vec<_> = self
            .recorded
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|delivery| delivery.execution == execution)
            .cloned()
            .collect();
        deliveries.sort_by_key(|delivery| delivery.sequence);
        deliveries
    }

    /// The events of `execution`, in delivery order.
    pub fn events(&self, execution: ExecutionId) -> Vec<ActionEvent<O, E>> {
        self.deliveries(execution)
            .into_iter()
            .map(|delivery| delivery.event)
            .collect()
    }
}

#[async_trait]
impl<O, E> ActionTap<O, E> for RecordingTap<O, E>
where
    O: Send + 'static,
    E: Send + 'static,
{
    async fn on_event(&self, event: ActionEvent<O, E>, ctx: TapContext) -> Result<()> {
        self.recorded.deliveries.lock().unwrap().push(Delivery {
            execution: ctx.execution,
            sequence: ctx.sequence,
            subscribers: ctx.subscribers,
            event,
        });
        self.recorded.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::error::ActionError;

    #[tokio::test]
    async fn test_manual_run_yields_what_controller_sends() {
        let (action, work) = manual_action::<&'static str, u32, String>();

        let mut execution = action.start("first");
        assert_eq!(work.starts(), 1);
        assert_eq!(work.inputs(), vec!["first"]);

        assert!(work.emit(0, 1));
        assert_eq!(execution.next().await, Some(ActionEvent::Value(1)));

        work.fail(0, "boom".to_string());
        assert_eq!(
            execution.next().await,
            Some(ActionEvent::Failed(ActionError::Failed("boom".to_string())))
        );
        assert!(!work.emit(0, 2));

        drop(execution);
        assert!(work.is_dropped(0));
        assert!(!work.is_cancelled(0));
    }

    #[tokio::test]
    async fn test_dropping_unfinished_run_counts_as_cancelled() {
        let (action, work) = manual_action::<(), u32, String>();

        let execution = action.start(());
        assert!(!work.is_dropped(0));

        drop(execution);
        tokio::time::timeout(Duration::from_secs(1), work.dropped(0))
            .await
            .expect("run was not dropped");
        assert!(work.is_cancelled(0));
    }

    #[tokio::test]
    async fn test_complete_ends_stream() {
        let (action, work) = manual_action::<(), u32, String>();
        let execution = action.start(());

        work.emit(0, 5);
        work.complete(0);

        let events: Vec<_> = execution.collect().await;
        assert_eq!(events, vec![ActionEvent::Value(5), ActionEvent::Completed]);
        assert!(!work.is_cancelled(0));
    }

    #[test]
    #[should_panic(expected = "never started")]
    fn test_unknown_run_panics() {
        let (_action, work) = manual_action::<(), u32, String>();
        work.is_dropped(3);
    }

    #[tokio::test]
    async fn test_recording_tap_orders_by_sequence() {
        let recorder = RecordingTap::<u32, String>::new();
        let execution = ExecutionId::new();
        let other = ExecutionId::new();
        let ctx = |execution, sequence| TapContext {
            execution,
            sequence,
            subscribers: 2,
            timestamp: std::time::Instant::now(),
        };

        // Taps are spawned per event, so arrival order is not guaranteed
        recorder
            .on_event(ActionEvent::Completed, ctx(execution, 1))
            .await
            .unwrap();
        recorder
            .on_event(ActionEvent::Value(9), ctx(other, 0))
            .await
            .unwrap();
        recorder
            .on_event(ActionEvent::Value(4), ctx(execution, 0))
            .await
            .unwrap();

        assert_eq!(recorder.len(), 3);
        assert_eq!(
            recorder.events(execution),
            vec![ActionEvent::Value(4), ActionEvent::Completed]
        );
        assert_eq!(recorder.deliveries(other)[0].subscribers, 2);
    }

    #[tokio::test]
    async fn test_recording_tap_wait_for() {
        let recorder = RecordingTap::<u32, String>::new();
        assert!(recorder.is_empty());

        let tap = recorder.clone();
        tokio::spawn(async move {
            for sequence in 0..2 {
                let ctx = TapContext {
                    execution: ExecutionId::new(),
                    sequence,
                    subscribers: 1,
                    timestamp: std::time::Instant::now(),
                };
                tap.on_event(ActionEvent::Value(1), ctx).await.unwrap();
            }
        });

        tokio::time::timeout(Duration::from_secs(1), recorder.wait_for(2))
            .await
            .expect("recorder timed out");
        assert_eq!(recorder.len(), 2);
    }
}
