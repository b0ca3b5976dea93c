//! Gate state: the single point of synchronization for a coordinator.
//!
//! The gate decides whether a start spawns work or joins existing work, owns
//! the subscriber set of the live execution, and fans out that execution's
//! events. Every transition happens under one mutex:
//!
//! ```text
//! Idle ──admit()──────────────────────────► Executing(inflight)
//!  ▲                                            │   │
//!  │        deliver(terminal) / last detach     │   │ admit() joins
//!  └────────────────────────────────────────────┘◄──┘
//! ```
//!
//! Each subscriber owns an unbounded queue. Events are pushed into every
//! queue while the lock is held, so a subscriber attached by `admit` sees
//! exactly the events emitted after it joined, a slow reader never loses
//! one, and a stale driver (whose execution was cancelled) can never deliver
//! into a newer execution.

use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::action::ExecutionLease;
use crate::core::{ActionEvent, ExecutionId, SubscriberId};
use crate::property::{MutableProperty, Property};

/// Snapshot of the live execution, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightInfo {
    /// The live execution.
    pub execution: ExecutionId,
    /// When the execution was started.
    pub started_at: DateTime<Utc>,
    /// Attached subscribers, ordered by join time.
    pub subscribers: Vec<SubscriberId>,
}

/// Receiving end of one subscriber's event queue.
pub(crate) type EventReceiver<O, E> = mpsc::UnboundedReceiver<ActionEvent<O, E>>;

struct Subscriber<O, E> {
    joined_at: DateTime<Utc>,
    queue: mpsc::UnboundedSender<ActionEvent<O, E>>,
}

struct Inflight<O, E> {
    id: ExecutionId,
    started_at: DateTime<Utc>,
    /// Subscriber set; its size is the reference count.
    subscribers: HashMap<SubscriberId, Subscriber<O, E>>,
    /// Held until the execution ends; dropping it clears the underlying
    /// action's executing flag.
    lease: Option<ExecutionLease>,
    /// Dropped with the inflight entry, which wakes the driver.
    _cancel: oneshot::Sender<()>,
}

enum GateState<O, E> {
    Idle,
    Executing(Inflight<O, E>),
}

/// Result of [`Gate::admit`].
pub(crate) enum Admission<O, E> {
    /// An execution was live; the subscriber joined it.
    Joined {
        execution: ExecutionId,
        receiver: EventReceiver<O, E>,
    },
    /// The gate was idle and is now reserved for a new execution. The caller
    /// must start the work and hand `cancelled` to its driver.
    Reserved {
        execution: ExecutionId,
        receiver: EventReceiver<O, E>,
        cancelled: oneshot::Receiver<()>,
    },
}

/// Result of [`Gate::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    /// The subscriber was not attached to that execution (already detached,
    /// or the execution already ended).
    NotAttached,
    /// Others are still attached; the work continues.
    Remaining(usize),
    /// That was the last subscriber; the execution was cancelled.
    Cancelled,
}

/// Result of [`Gate::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivered {
    /// A value was queued for this many subscribers.
    Value { subscribers: usize },
    /// The terminal event was queued and the gate is idle again.
    Finished { subscribers: usize },
    /// The execution is no longer live; nothing was sent.
    Stale,
}

pub(crate) struct Gate<O, E> {
    state: Mutex<GateState<O, E>>,
    executing: MutableProperty<bool>,
}

impl<O, E> Gate<O, E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            executing: MutableProperty::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState<O, E>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("gate mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Move to Idle, publishing `is_executing = false`.
    ///
    /// The caller drops the returned entry while still holding the lock, so
    /// the lease is released before any new start can be admitted.
    fn clear(&self, state: &mut GateState<O, E>) -> Option<Inflight<O, E>> {
        let previous = mem::replace(state, GateState::Idle);
        self.executing.set(false);
        match previous {
            GateState::Executing(inflight) => Some(inflight),
            GateState::Idle => None,
        }
    }

    /// Attach the underlying action's lease to the live execution.
    ///
    /// If `execution` is no longer live the lease is dropped immediately.
    pub(crate) fn install_lease(&self, execution: ExecutionId, lease: ExecutionLease) {
        let mut state = self.lock();
        match &mut *state {
            GateState::Executing(inflight) if inflight.id == execution => {
                inflight.lease = Some(lease);
            }
            _ => {
                debug!(%execution, "execution ended before its lease was installed");
                drop(lease);
            }
        }
    }

    /// Remove a subscriber from an execution.
    ///
    /// Removing the last subscriber cancels the execution and returns the
    /// gate to Idle.
    pub(crate) fn detach(&self, execution: ExecutionId, subscriber: SubscriberId) -> Detached {
        let mut state = self.lock();

        let remaining = match &mut *state {
            GateState::Executing(inflight) if inflight.id == execution => {
                if inflight.subscribers.remove(&subscriber).is_none() {
                    return Detached::NotAttached;
                }
                inflight.subscribers.len()
            }
            _ => return Detached::NotAttached,
        };

        if remaining > 0 {
            debug!(%execution, %subscriber, remaining, "subscriber detached");
            return Detached::Remaining(remaining);
        }

        let cancelled = self.clear(&mut state);
        drop(cancelled);
        info!(%execution, %subscriber, "last subscriber detached, execution cancelled");
        Detached::Cancelled
    }

    /// End `execution` without a terminal event.
    ///
    /// Used when the driver stops unexpectedly. Dropping the subscribers'
    /// queues closes them, which they surface as cancellation. Returns true
    /// if the execution was still live.
    pub(crate) fn abandon(&self, execution: ExecutionId) -> bool {
        let mut state = self.lock();

        let live = matches!(&*state, GateState::Executing(inflight) if inflight.id == execution);
        if !live {
            return false;
        }

        let abandoned = self.clear(&mut state);
        drop(abandoned);
        warn!(%execution, "execution ended without a terminal event");
        true
    }

    pub(crate) fn is_executing(&self) -> Property<bool> {
        self.executing.property()
    }

    pub(crate) fn inflight(&self) -> Option<InflightInfo> {
        let state = self.lock();
        match &*state {
            GateState::Idle => None,
            GateState::Executing(inflight) => {
                let mut joined: Vec<_> = inflight
                    .subscribers
                    .iter()
                    .map(|(id, subscriber)| (subscriber.joined_at, *id))
                    .collect();
                joined.sort();
                Some(InflightInfo {
                    execution: inflight.id,
                    started_at: inflight.started_at,
                    subscribers: joined.into_iter().map(|(_, id)| id).collect(),
                })
            }
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        match &*self.lock() {
            GateState::Idle => 0,
            GateState::Executing(inflight) => inflight.subscribers.len(),
        }
    }

    /// Join the live execution, or reserve the gate for a new one.
    pub(crate) fn admit(&self, subscriber: SubscriberId) -> Admission<O, E> {
        let mut state = self.lock();
        let (queue, receiver) = mpsc::unbounded_channel();
        let joined = Subscriber {
            joined_at: Utc::now(),
            queue,
        };

        if let GateState::Executing(inflight) = &mut *state {
            inflight.subscribers.insert(subscriber, joined);
            debug!(
                execution = %inflight.id,
                %subscriber,
                subscribers = inflight.subscribers.len(),
                "joined live execution"
            );
            return Admission::Joined {
                execution: inflight.id,
                receiver,
            };
        }

        let execution = ExecutionId::new();
        let (cancel, cancelled) = oneshot::channel();
        let started_at = joined.joined_at;
        let mut subscribers = HashMap::new();
        subscribers.insert(subscriber, joined);

        *state = GateState::Executing(Inflight {
            id: execution,
            started_at,
            subscribers,
            lease: None,
            _cancel: cancel,
        });
        self.executing.set(true);
        debug!(%execution, %subscriber, "gate reserved for new execution");

        Admission::Reserved {
            execution,
            receiver,
            cancelled,
        }
    }
}

impl<O: Clone, E: Clone> Gate<O, E> {
    /// Queue an event of `execution` for every subscriber.
    ///
    /// A terminal event ends the execution: the gate goes Idle before the
    /// event is queued, so a subscriber that observes the terminal event also
    /// observes `is_executing == false`. Dropping the finished entry closes
    /// every queue behind its terminal event.
    pub(crate) fn deliver(&self, execution: ExecutionId, event: ActionEvent<O, E>) -> Delivered {
        let mut state = self.lock();

        let GateState::Executing(inflight) = &*state else {
            return Delivered::Stale;
        };
        if inflight.id != execution {
            return Delivered::Stale;
        }

        if !event.is_terminal() {
            let subscribers = fan_out(&inflight.subscribers, &event);
            return Delivered::Value { subscribers };
        }

        let kind = event.kind();
        let Some(mut finished) = self.clear(&mut state) else {
            return Delivered::Stale;
        };
        // Observers of the terminal event must see the action idle
        drop(finished.lease.take());
        let subscribers = fan_out(&finished.subscribers, &event);
        let elapsed = Utc::now() - finished.started_at;
        drop(finished);

        info!(
            %execution,
            outcome = kind,
            subscribers,
            elapsed_ms = elapsed.num_milliseconds(),
            "execution finished"
        );
        Delivered::Finished { subscribers }
    }
}

/// Push `event` into every subscriber queue, returning the subscriber count.
fn fan_out<O: Clone, E: Clone>(
    subscribers: &HashMap<SubscriberId, Subscriber<O, E>>,
    event: &ActionEvent<O, E>,
) -> usize {
    for subscriber in subscribers.values() {
        // A handle detaches before its receiver is dropped
        let _ = subscriber.queue.send(event.clone());
    }
    subscribers.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;

    type TestGate = Gate<u32, String>;

    fn reserve(gate: &TestGate, subscriber: SubscriberId) -> (ExecutionId, oneshot::Receiver<()>) {
        match gate.admit(subscriber) {
            Admission::Reserved {
                execution,
                cancelled,
                ..
            } => (execution, cancelled),
            Admission::Joined { .. } => panic!("expected the gate to be idle"),
        }
    }

    #[test]
    fn test_first_admit_reserves_then_joins() {
        let gate = TestGate::new();
        let executing = gate.is_executing();
        assert!(!executing.get());

        let first = SubscriberId::new();
        let (execution, _cancelled) = reserve(&gate, first);
        assert!(executing.get());

        match gate.admit(SubscriberId::new()) {
            Admission::Joined {
                execution: joined, ..
            } => assert_eq!(joined, execution),
            Admission::Reserved { .. } => panic!("second admit must join"),
        }
        assert_eq!(gate.subscriber_count(), 2);
    }

    #[test]
    fn test_partial_detach_keeps_execution() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        let (execution, mut cancelled) = reserve(&gate, a);
        let _ = gate.admit(b);

        assert_eq!(gate.detach(execution, a), Detached::Remaining(1));
        assert!(gate.is_executing().get());
        assert_eq!(
            cancelled.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        );

        // Idempotent
        assert_eq!(gate.detach(execution, a), Detached::NotAttached);
    }

    #[test]
    fn test_last_detach_cancels_and_goes_idle() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let (execution, mut cancelled) = reserve(&gate, a);

        assert_eq!(gate.detach(execution, a), Detached::Cancelled);
        assert!(!gate.is_executing().get());
        assert!(gate.inflight().is_none());
        assert_eq!(
            cancelled.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        );
    }

    #[test]
    fn test_deliver_value_then_terminal() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let (execution, mut receiver, _cancelled) = match gate.admit(a) {
            Admission::Reserved {
                execution,
                receiver,
                cancelled,
            } => (execution, receiver, cancelled),
            Admission::Joined { .. } => panic!("expected reservation"),
        };

        assert_eq!(
            gate.deliver(execution, ActionEvent::Value(1)),
            Delivered::Value { subscribers: 1 }
        );
        assert_eq!(
            gate.deliver(execution, ActionEvent::Completed),
            Delivered::Finished { subscribers: 1 }
        );
        assert!(!gate.is_executing().get());

        assert_eq!(receiver.try_recv().unwrap(), ActionEvent::Value(1));
        assert_eq!(receiver.try_recv().unwrap(), ActionEvent::Completed);
    }

    #[test]
    fn test_joiner_queue_starts_at_join() {
        let gate = TestGate::new();
        let (execution, _cancelled) = reserve(&gate, SubscriberId::new());
        gate.deliver(execution, ActionEvent::Value(1));

        let mut late = match gate.admit(SubscriberId::new()) {
            Admission::Joined { receiver, .. } => receiver,
            Admission::Reserved { .. } => panic!("expected a join"),
        };
        assert_eq!(
            gate.deliver(execution, ActionEvent::Value(2)),
            Delivered::Value { subscribers: 2 }
        );
        gate.deliver(execution, ActionEvent::Completed);

        assert_eq!(late.try_recv().unwrap(), ActionEvent::Value(2));
        assert_eq!(late.try_recv().unwrap(), ActionEvent::Completed);
        assert_eq!(
            late.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn test_stale_execution_cannot_deliver() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let (old, _c1) = reserve(&gate, a);
        gate.detach(old, a);

        let (current, _c2) = reserve(&gate, SubscriberId::new());
        assert_eq!(gate.deliver(old, ActionEvent::Value(9)), Delivered::Stale);
        assert_eq!(
            gate.deliver(
                old,
                ActionEvent::Failed(ActionError::Failed("late".to_string()))
            ),
            Delivered::Stale
        );
        assert!(gate.is_executing().get());
        assert_eq!(gate.inflight().unwrap().execution, current);
    }

    #[test]
    fn test_detach_after_finish_is_noop() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let (execution, _cancelled) = reserve(&gate, a);
        gate.deliver(execution, ActionEvent::Completed);

        assert_eq!(gate.detach(execution, a), Detached::NotAttached);
        assert!(!gate.is_executing().get());
    }

    #[test]
    fn test_abandon_closes_queues() {
        let gate = TestGate::new();
        let (execution, mut receiver, _cancelled) = match gate.admit(SubscriberId::new()) {
            Admission::Reserved {
                execution,
                receiver,
                cancelled,
            } => (execution, receiver, cancelled),
            Admission::Joined { .. } => panic!("expected reservation"),
        };

        assert!(gate.abandon(execution));
        assert!(!gate.abandon(execution));
        assert!(!gate.is_executing().get());
        assert_eq!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn test_inflight_snapshot() {
        let gate = TestGate::new();
        let a = SubscriberId::new();
        let (execution, _cancelled) = reserve(&gate, a);

        let info = gate.inflight().unwrap();
        assert_eq!(info.execution, execution);
        assert_eq!(info.subscribers, vec![a]);
        assert!(info.started_at <= Utc::now());
    }
}
