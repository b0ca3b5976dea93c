//! The underlying action: one input in, one execution out.
//!
//! An [`Action`] wraps a work factory. Each accepted [`Action::start`] call
//! produces exactly one [`Execution`], a stream of [`ActionEvent`]s that ends
//! with one terminal event.
//!
//! # Key Properties
//!
//! - **No concurrency handling**: while an execution is unresolved, further
//!   starts are rejected with [`ActionError::Disabled`]. Sharing one
//!   execution between callers is [`CoalescingAction`]'s job.
//! - **Never fails synchronously**: rejections and work failures both arrive
//!   as the terminal event of the returned execution.
//! - **Process-lifetime history**: every value and every work error of every
//!   execution is published to [`Action::values`] / [`Action::errors`].
//!
//! [`CoalescingAction`]: crate::CoalescingAction
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let fetch = Action::from_async(|user_id: u64| async move {
//!     api.profile(user_id).await
//! });
//!
//! let mut execution = fetch.start(42);
//! while let Some(event) = execution.next().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::CoalesceConfig;
use crate::core::{ActionEvent, ActionProtocol, ExecutionId, Work};
use crate::error::{ActionError, SharedError};
use crate::property::{MutableProperty, Property};

type WorkFactory<I, O, E> = Box<dyn Fn(I) -> Work<O, E> + Send + Sync>;

// =============================================================================
// Status
// =============================================================================

struct Flags {
    enabled: bool,
    executing: Option<ExecutionId>,
}

/// Executing/enabled bookkeeping for one action.
///
/// All three properties are published inside the same critical section, so
/// `is_enabled` is never observed disagreeing with `is_executing`.
pub(crate) struct ActionStatus {
    flags: Mutex<Flags>,
    executing: MutableProperty<bool>,
    enabled: MutableProperty<bool>,
    available: MutableProperty<bool>,
}

impl ActionStatus {
    fn new(enabled: bool) -> Self {
        Self {
            flags: Mutex::new(Flags {
                enabled,
                executing: None,
            }),
            executing: MutableProperty::new(false),
            enabled: MutableProperty::new(enabled),
            available: MutableProperty::new(enabled),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("action status mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn transition<R>(&self, f: impl FnOnce(&mut Flags) -> R) -> R {
        let mut flags = self.lock();
        let result = f(&mut flags);
        self.executing.set(flags.executing.is_some());
        self.enabled.set(flags.enabled);
        self.available
            .set(flags.enabled && flags.executing.is_none());
        result
    }

    /// Mark `id` as the unresolved execution, if the action is available.
    fn try_acquire(&self, id: ExecutionId) -> bool {
        self.transition(|flags| {
            if flags.enabled && flags.executing.is_none() {
                flags.executing = Some(id);
                true
            } else {
                false
            }
        })
    }

    fn release(&self, id: ExecutionId) {
        self.transition(|flags| {
            if flags.executing == Some(id) {
                flags.executing = None;
            }
        });
    }

    fn set_enabled(&self, enabled: bool) {
        self.transition(|flags| flags.enabled = enabled);
    }

    pub(crate) fn is_enabled_now(&self) -> bool {
        self.lock().enabled
    }
}

/// Marks an execution as unresolved for as long as it is held.
///
/// Dropping the lease clears the owning action's `is_executing` flag.
/// Release is keyed by execution id, so a stale lease can never clear a
/// newer execution.
pub struct ExecutionLease {
    status: Arc<ActionStatus>,
    execution: ExecutionId,
}

impl ExecutionLease {
    /// The execution this lease belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        self.status.release(self.execution);
    }
}

impl fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLease")
            .field("execution", &self.execution)
            .finish()
    }
}

// =============================================================================
// Execution
// =============================================================================

struct Channels<O, E> {
    values: broadcast::Sender<O>,
    errors: broadcast::Sender<E>,
}

enum ExecutionState<O, E> {
    Running(Work<O, E>),
    Rejected,
    Finished,
}

/// One run of an [`Action`], as a stream of [`ActionEvent`]s.
///
/// Yields `Value`s in the order the work produced them, then exactly one
/// terminal event, then `None`. The execution's lease is released before the
/// terminal event is yielded, so `is_executing` is already false when a
/// caller observes `Completed` or `Failed`.
///
/// Dropping an unfinished execution drops the work (cancelling it) and
/// releases the lease.
pub struct Execution<O, E> {
    id: ExecutionId,
    state: ExecutionState<O, E>,
    lease: Option<ExecutionLease>,
    channels: Arc<Channels<O, E>>,
}

impl<O, E> Execution<O, E> {
    /// The id of this execution.
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Returns true if the action was disabled and no work was started.
    pub fn is_rejected(&self) -> bool {
        matches!(self.state, ExecutionState::Rejected)
    }

    /// Detach the lease so its lifetime can be managed separately from the
    /// stream. The stream keeps publishing values and errors.
    pub(crate) fn take_lease(&mut self) -> Option<ExecutionLease> {
        self.lease.take()
    }

    fn finish(&mut self) {
        self.state = ExecutionState::Finished;
        self.lease = None;
    }
}

impl<O, E> Stream for Execution<O, E>
where
    O: Clone,
    E: Clone,
{
    type Item = ActionEvent<O, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let polled = match &mut this.state {
            ExecutionState::Finished => return Poll::Ready(None),
            ExecutionState::Rejected => {
                this.state = ExecutionState::Finished;
                return Poll::Ready(Some(ActionEvent::Failed(ActionError::Disabled)));
            }
            ExecutionState::Running(work) => futures::ready!(work.poll_next_unpin(cx)),
        };

        let event = match polled {
            Some(Ok(value)) => {
                // No observers is fine
                let _ = this.channels.values.send(value.clone());
                ActionEvent::Value(value)
            }
            Some(Err(error)) => {
                let _ = this.channels.errors.send(error.clone());
                this.finish();
                ActionEvent::Failed(ActionError::Failed(error))
            }
            None => {
                this.finish();
                ActionEvent::Completed
            }
        };

        Poll::Ready(Some(event))
    }
}

impl<O, E> Drop for Execution<O, E> {
    fn drop(&mut self) {
        if matches!(self.state, ExecutionState::Running(_)) {
            debug!(execution = %self.id, "execution dropped before terminating, cancelling work");
        }
    }
}

impl<O, E> fmt::Debug for Execution<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ExecutionState::Running(_) => "running",
            ExecutionState::Rejected => "rejected",
            ExecutionState::Finished => "finished",
        };
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("state", &state)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

// =============================================================================
// Action
// =============================================================================

struct ActionInner<I, O, E> {
    work: WorkFactory<I, O, E>,
    status: Arc<ActionStatus>,
    channels: Arc<Channels<O, E>>,
    config: CoalesceConfig,
}

/// Starts one unit of work per accepted input.
///
/// Cheap to clone; clones share the same work factory, status and history
/// channels.
pub struct Action<I, O, E> {
    inner: Arc<ActionInner<I, O, E>>,
}

impl<I, O, E> Clone for Action<I, O, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O, E> Action<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an enabled action from a stream-producing work factory.
    pub fn new<F, S>(work: F) -> Self
    where
        F: Fn(I) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<O, E>> + Send + 'static,
    {
        Self::builder(work).build()
    }

    /// Create an enabled action whose work yields a single value.
    pub fn from_async<F, Fut>(work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        Self::new(move |input| stream::once(work(input)))
    }

    /// Start building an action.
    pub fn builder<F, S>(work: F) -> ActionBuilder<I, O, E>
    where
        F: Fn(I) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<O, E>> + Send + 'static,
    {
        ActionBuilder {
            work: Box::new(move |input| work(input).boxed()),
            enabled: true,
            config: CoalesceConfig::default(),
        }
    }

    /// Start one execution.
    ///
    /// If the action is disabled, or an execution is still unresolved, the
    /// returned execution yields a single `Failed(ActionError::Disabled)`
    /// and the work factory is not called.
    pub fn start(&self, input: I) -> Execution<O, E> {
        self.start_execution(ExecutionId::new(), input)
    }

    pub(crate) fn start_execution(&self, id: ExecutionId, input: I) -> Execution<O, E> {
        let channels = self.inner.channels.clone();

        if !self.inner.status.try_acquire(id) {
            debug!(execution = %id, "action unavailable, rejecting start");
            return Execution {
                id,
                state: ExecutionState::Rejected,
                lease: None,
                channels,
            };
        }

        debug!(execution = %id, "starting execution");
        let lease = ExecutionLease {
            status: self.inner.status.clone(),
            execution: id,
        };
        let work = (self.inner.work)(input);

        Execution {
            id,
            state: ExecutionState::Running(work),
            lease: Some(lease),
            channels,
        }
    }

    /// True while an execution is unresolved.
    pub fn is_executing(&self) -> Property<bool> {
        self.inner.status.executing.property()
    }

    /// True while [`start`](Self::start) would be accepted: enabled and not
    /// executing.
    pub fn is_enabled(&self) -> Property<bool> {
        self.inner.status.available.property()
    }

    /// The external enabling condition alone, ignoring execution state.
    pub fn enabled_condition(&self) -> Property<bool> {
        self.inner.status.enabled.property()
    }

    /// Enable or disable the action.
    ///
    /// An unresolved execution is not affected.
    pub fn set_enabled(&self, enabled: bool) {
        debug!(enabled, "setting action enabled condition");
        self.inner.status.set_enabled(enabled);
    }

    /// Every value produced by every execution, from now on.
    pub fn values(&self) -> broadcast::Receiver<O> {
        self.inner.channels.values.subscribe()
    }

    /// Every work error produced by every execution, from now on.
    pub fn errors(&self) -> broadcast::Receiver<E> {
        self.inner.channels.errors.subscribe()
    }

    pub(crate) fn status(&self) -> &ActionStatus {
        &self.inner.status
    }

    /// Channel sizing this action was built with.
    pub fn config(&self) -> CoalesceConfig {
        self.inner.config
    }
}

impl<I, O> Action<I, O, SharedError>
where
    I: 'static,
    O: Clone + Send + 'static,
{
    /// Create an action from `anyhow`-returning work.
    ///
    /// Errors are wrapped in [`SharedError`] so every observer gets a copy.
    pub fn from_fallible<F, Fut>(work: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self::from_async(move |input| {
            let fut = work(input);
            async move { fut.await.map_err(Arc::new) }
        })
    }
}

impl<I, O, E> ActionProtocol for Action<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Input = I;
    type Output = O;
    type Error = E;
    type Execution = Execution<O, E>;

    fn apply(&self, input: I) -> Execution<O, E> {
        self.start(input)
    }

    fn is_executing(&self) -> Property<bool> {
        Action::is_executing(self)
    }

    fn is_enabled(&self) -> Property<bool> {
        Action::is_enabled(self)
    }

    fn values(&self) -> broadcast::Receiver<O> {
        Action::values(self)
    }

    fn errors(&self) -> broadcast::Receiver<E> {
        Action::errors(self)
    }
}

impl<I, O, E> fmt::Debug for Action<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("executing", &self.inner.status.executing.get())
            .field("enabled", &self.inner.status.enabled.get())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Action Builder
// =============================================================================

/// Builder for [`Action`].
///
/// # Example
///
/// ```ignore
/// let sync = Action::builder(|folder: FolderId| client.sync(folder))
///     .enabled(false) // turned on once the account is connected
///     .with_history_capacity(64)
///     .build();
/// ```
pub struct ActionBuilder<I, O, E> {
    work: WorkFactory<I, O, E>,
    enabled: bool,
    config: CoalesceConfig,
}

impl<I, O, E> ActionBuilder<I, O, E>
where
    I: 'static,
    O: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Initial value of the enabling condition. Defaults to `true`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Use the given channel sizing.
    ///
    /// A [`CoalescingAction`](crate::CoalescingAction) built on this action
    /// inherits it unless overridden.
    pub fn with_config(mut self, config: CoalesceConfig) -> Self {
        self.config = config;
        self
    }

    /// Capacity of the `values`/`errors` channels.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Build the action.
    pub fn build(self) -> Action<I, O, E> {
        let config = self.config.normalized();
        let (values, _) = broadcast::channel(config.history_capacity);
        let (errors, _) = broadcast::channel(config.history_capacity);

        Action {
            inner: Arc::new(ActionInner {
                work: self.work,
                status: Arc::new(ActionStatus::new(self.enabled)),
                channels: Arc::new(Channels { values, errors }),
                config,
            }),
        }
    }
}
