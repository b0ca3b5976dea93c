//! Observable state backed by `tokio::sync::watch`.
//!
//! # Guarantees
//!
//! - **Latest value only**: observers see the current value, not a history
//! - **Non-owning**: a [`Property`] keeps the channel alive, never the object
//!   that publishes into it
//! - **Any thread**: reading never mutates the publisher's state
//!
//! An action's `is_executing`/`is_enabled` flags are handed out as
//! `Property<bool>`, so UI code can hold them for as long as it likes without
//! extending the action's lifetime.

use std::fmt;

use tokio::sync::watch;

/// Read-only view of a value that changes over time.
///
/// # Example
///
/// ```ignore
/// let mut executing = action.is_executing();
///
/// // Current value
/// let busy = executing.get();
///
/// // Wait until the action goes idle
/// executing.wait_for(|busy| !busy).await;
/// ```
#[derive(Clone)]
pub struct Property<T> {
    receiver: watch::Receiver<T>,
}

impl<T: Clone> Property<T> {
    /// Current value.
    pub fn get(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change and return the new value.
    ///
    /// Returns `None` once the publisher is gone and no further change can
    /// happen.
    pub async fn changed(&mut self) -> Option<T> {
        match self.receiver.changed().await {
            Ok(()) => Some((*self.receiver.borrow_and_update()).clone()),
            Err(_) => None,
        }
    }

    /// Wait until the value satisfies `predicate` and return it.
    ///
    /// Returns immediately if the current value already matches. Returns
    /// `None` if the publisher is dropped first.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        match self.receiver.wait_for(|value| predicate(value)).await {
            Ok(value) => Some((*value).clone()),
            Err(_) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("value", &*self.receiver.borrow())
            .finish()
    }
}

/// Publisher side of a [`Property`].
///
/// Setting a value equal to the current one does not wake observers.
pub struct MutableProperty<T> {
    sender: watch::Sender<T>,
}

impl<T: Clone + PartialEq> MutableProperty<T> {
    /// Create a property with an initial value.
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Publish a new value.
    ///
    /// Returns true if the value changed.
    pub fn set(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Hand out a read-only view.
    pub fn property(&self) -> Property<T> {
        Property {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live read-only views.
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: fmt::Debug> fmt::Debug for MutableProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableProperty")
            .field("value", &*self.sender.borrow())
            .field("observers", &self.sender.receiver_count())
            .finish()
    }
}
