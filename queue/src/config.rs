use crate::QueueError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of slots allocated when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 20;

/// How long a drop-oldest producer waits before evicting an unread slot.
pub const DEFAULT_DROP_TIMEOUT_MS: u64 = 500;

/// What a producer does when every slot is full or checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait until a consumer hands a slot back. Lossless.
    #[default]
    Block,
    /// Wait at most `timeout_ms`, then reclaim the oldest unread slot.
    DropOldest {
        #[serde(default = "default_drop_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_drop_timeout_ms() -> u64 {
    DEFAULT_DROP_TIMEOUT_MS
}

impl OverflowPolicy {
    /// Drop-oldest with the default timeout.
    pub fn drop_oldest() -> Self {
        OverflowPolicy::DropOldest {
            timeout_ms: DEFAULT_DROP_TIMEOUT_MS,
        }
    }

    /// The eviction timeout, or `None` for the blocking policy.
    pub fn drop_timeout(&self) -> Option<Duration> {
        match self {
            OverflowPolicy::Block => None,
            OverflowPolicy::DropOldest { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "block"),
            OverflowPolicy::DropOldest { timeout_ms } => write!(f, "drop-oldest({}ms)", timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: OverflowPolicy::Block,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self { capacity, policy }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if let OverflowPolicy::DropOldest { timeout_ms: 0 } = self.policy {
            return Err(QueueError::InvalidConfig(
                "drop timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
