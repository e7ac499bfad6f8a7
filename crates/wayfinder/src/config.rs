//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_INBOX_CAPACITY: usize = 64;
pub const DEFAULT_EMITTED_CAPACITY: usize = 256;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Tunables for an [`Engine`](crate::Engine).
///
/// Deserializable so host applications can load it from whatever config
/// source they already use; missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer size of each controller's inbox. Senders wait when it is full.
    pub inbox_capacity: usize,

    /// Buffer size of the broadcast bus behind `Outbox::emit`. Slow
    /// subscribers lag and miss records.
    pub emitted_capacity: usize,

    /// How long `EngineHandle::shutdown` waits for background processes to
    /// exit after they were told to stop. `None` skips waiting.
    pub shutdown_grace_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            emitted_capacity: DEFAULT_EMITTED_CAPACITY,
            shutdown_grace_ms: Some(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl EngineConfig {
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_emitted_capacity(mut self, capacity: usize) -> Self {
        self.emitted_capacity = capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Option<Duration>) -> Self {
        self.shutdown_grace_ms =
            grace.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        self.shutdown_grace_ms.map(Duration::from_millis)
    }

    /// Channel sizes with zero clamped to one.
    pub(crate) fn normalized(mut self) -> Self {
        self.inbox_capacity = self.inbox_capacity.max(1);
        self.emitted_capacity = self.emitted_capacity.max(1);
        self
    }
}
