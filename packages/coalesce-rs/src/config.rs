//! Channel sizing for actions.
//!
//! The history capacity sizes the process-lifetime `values`/`errors`
//! broadcast channels, so it bounds how far a slow observer of those streams
//! may fall behind before it starts skipping values. It never bounds the work
//! itself, and handles of a coalescing action are never lossy.
//!
//! # Example
//!
//! ```ignore
//! let config: CoalesceConfig = serde_json::from_str(r#"{ "history_capacity": 64 }"#)?;
//!
//! let refresh = CoalescingAction::new(
//!     Action::builder(fetch_feed).with_config(config).build(),
//! );
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default capacity of the process-lifetime `values`/`errors` channels.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Channel sizing of an [`Action`](crate::Action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// How many values (and, separately, errors) the process-lifetime
    /// streams buffer for slow observers.
    pub history_capacity: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl CoalesceConfig {
    /// Set the history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Clamp a zero capacity to 1.
    ///
    /// Broadcast channels cannot be created with zero capacity.
    pub(crate) fn normalized(self) -> Self {
        Self {
            history_capacity: clamp_capacity("history_capacity", self.history_capacity),
        }
    }
}

fn clamp_capacity(field: &'static str, capacity: usize) -> usize {
    if capacity == 0 {
        warn!(field, "zero channel capacity is not allowed, using 1");
        1
    } else {
        capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoalesceConfig::default();
        assert_eq!(config.history_capacity, DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn test_deserialize() {
        let config: CoalesceConfig =
            serde_json::from_str(r#"{ "history_capacity": 8 }"#).unwrap();
        assert_eq!(config.history_capacity, 8);
    }

    #[test]
    fn test_deserialize_empty_object() {
        let config: CoalesceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CoalesceConfig::default());
    }

    #[test]
    fn test_serialize_field_names() {
        let json = serde_json::to_value(CoalesceConfig::default()).unwrap();
        assert_eq!(json["history_capacity"], DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn test_normalized_clamps_zero() {
        let config = CoalesceConfig::default()
            .with_history_capacity(0)
            .normalized();
        assert_eq!(config.history_capacity, 1);
    }

    #[test]
    fn test_normalized_keeps_nonzero() {
        let config = CoalesceConfig::default()
            .with_history_capacity(3)
            .normalized();
        assert_eq!(config.history_capacity, 3);
    }
}
