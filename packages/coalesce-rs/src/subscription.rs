//! Subscriber handles: one caller's view onto a shared execution.
//!
//! # Guarantees
//!
//! - **Ordered**: events arrive in the order the work emitted them
//! - **Exactly one terminal**: every handle ends with one `Completed` or
//!   `Failed`, even under concurrent cancellation
//! - **Independent**: cancelling or dropping a handle only removes that
//!   caller's interest; the work is cancelled when the last handle goes
//! - **No replay**: a handle that joins late sees only events emitted after
//!   it joined
//! - **Lossless**: events queue up until the handle reads them, however far
//!   behind it falls

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tracing::debug;

use crate::core::{ActionEvent, ExecutionId, SubscriberId};
use crate::error::ActionError;
use crate::gate::{Detached, EventReceiver, Gate};

enum Delivery<O, E> {
    Live {
        receiver: EventReceiver<O, E>,
        gate: Arc<Gate<O, E>>,
        execution: ExecutionId,
    },
    Ready(ActionEvent<O, E>),
    Done,
}

/// Handle returned by [`CoalescingAction::start`](crate::CoalescingAction::start).
///
/// Dropping a handle detaches it, exactly like [`cancel`](Self::cancel).
///
/// # Example
///
/// ```ignore
/// let mut handle = refresh.start(feed_id);
///
/// while let Some(event) = handle.recv().await {
///     match event {
///         ActionEvent::Value(page) => render(page),
///         ActionEvent::Completed => break,
///         ActionEvent::Failed(err) => return Err(err.into()),
///     }
/// }
/// ```
pub struct Subscription<O, E> {
    id: SubscriberId,
    execution: Option<ExecutionId>,
    delivery: Delivery<O, E>,
}

impl<O, E> Subscription<O, E>
where
    O: Clone,
    E: Clone,
{
    pub(crate) fn attached(
        id: SubscriberId,
        execution: ExecutionId,
        receiver: EventReceiver<O, E>,
        gate: Arc<Gate<O, E>>,
    ) -> Self {
        Self {
            id,
            execution: Some(execution),
            delivery: Delivery::Live {
                receiver,
                gate,
                execution,
            },
        }
    }

    pub(crate) fn disabled(id: SubscriberId) -> Self {
        Self {
            id,
            execution: None,
            delivery: Delivery::Ready(ActionEvent::Failed(ActionError::Disabled)),
        }
    }

    /// This handle's subscriber id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The execution this handle joined, or `None` if the start was
    /// rejected because the action was disabled.
    pub fn execution_id(&self) -> Option<ExecutionId> {
        self.execution
    }

    /// True until the handle has received its terminal event or was
    /// cancelled.
    pub fn is_attached(&self) -> bool {
        matches!(self.delivery, Delivery::Live { .. })
    }

    /// Receive the next event.
    ///
    /// Returns `None` after the terminal event has been returned. Cancel
    /// safe.
    pub async fn recv(&mut self) -> Option<ActionEvent<O, E>> {
        let received = match &mut self.delivery {
            Delivery::Done => return None,
            Delivery::Ready(_) => {
                return match mem::replace(&mut self.delivery, Delivery::Done) {
                    Delivery::Ready(event) => Some(event),
                    _ => None,
                };
            }
            Delivery::Live { receiver, .. } => receiver.recv().await,
        };

        match received {
            Some(event) => {
                if event.is_terminal() {
                    // The gate already went idle; nothing to detach
                    self.delivery = Delivery::Done;
                }
                Some(event)
            }
            None => {
                debug!(subscriber = %self.id, "execution ended without a terminal event");
                self.delivery = Delivery::Done;
                Some(ActionEvent::Failed(ActionError::Cancelled))
            }
        }
    }

    /// Withdraw this caller's interest in the execution.
    ///
    /// Idempotent and non-blocking. If the handle had not yet received its
    /// terminal event, the next [`recv`](Self::recv) returns
    /// `Failed(ActionError::Cancelled)` and buffered values are discarded.
    /// If the execution had already finished, cancelling has no effect and
    /// the buffered events, terminal included, are still delivered.
    pub fn cancel(&mut self) {
        let (gate, execution) = match &self.delivery {
            Delivery::Live {
                gate, execution, ..
            } => (gate.clone(), *execution),
            // A ready result or a finished handle is left as is
            Delivery::Ready(_) | Delivery::Done => return,
        };

        match gate.detach(execution, self.id) {
            Detached::NotAttached => {
                debug!(
                    subscriber = %self.id,
                    %execution,
                    "execution already finished, cancel has no effect"
                );
            }
            Detached::Remaining(remaining) => {
                debug!(subscriber = %self.id, %execution, remaining, "handle cancelled");
                self.delivery = Delivery::Ready(ActionEvent::Failed(ActionError::Cancelled));
            }
            Detached::Cancelled => {
                self.delivery = Delivery::Ready(ActionEvent::Failed(ActionError::Cancelled));
            }
        }
    }

    /// Turn the handle into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = ActionEvent<O, E>> + Send
    where
        O: Send + 'static,
        E: Send + 'static,
    {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }

    /// Wait for the terminal event and return the last value produced.
    ///
    /// `Ok(None)` means the work completed without producing a value.
    pub async fn result(mut self) -> Result<Option<O>, ActionError<E>> {
        let mut last = None;
        while let Some(event) = self.recv().await {
            match event {
                ActionEvent::Value(value) => last = Some(value),
                ActionEvent::Completed => return Ok(last),
                ActionEvent::Failed(err) => return Err(err),
            }
        }
        Ok(last)
    }

    /// Wait for the terminal event and return every value produced after
    /// this handle attached.
    pub async fn collect_values(mut self) -> Result<Vec<O>, ActionError<E>> {
        let mut values = Vec::new();
        while let Some(event) = self.recv().await {
            match event {
                ActionEvent::Value(value) => values.push(value),
                ActionEvent::Completed => return Ok(values),
                ActionEvent::Failed(err) => return Err(err),
            }
        }
        Ok(values)
    }

    /// Like [`result`](Self::result), giving up after `duration`.
    ///
    /// On expiry the handle is dropped (detaching it) and
    /// `ActionError::Timeout` is returned. Other handles on the same
    /// execution are unaffected.
    pub async fn result_timeout(self, duration: Duration) -> Result<Option<O>, ActionError<E>> {
        match tokio::time::timeout(duration, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout { duration }),
        }
    }
}

impl<O, E> Drop for Subscription<O, E> {
    fn drop(&mut self) {
        if let Delivery::Live {
            gate, execution, ..
        } = &self.delivery
        {
            gate.detach(*execution, self.id);
        }
    }
}

impl<O, E> fmt::Debug for Subscription<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.delivery {
            Delivery::Live { .. } => "attached",
            Delivery::Ready(_) => "ready",
            Delivery::Done => "done",
        };
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("execution", &self.execution)
            .field("state", &state)
            .finish()
    }
}
