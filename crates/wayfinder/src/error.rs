//! Error types for reconciliation, routing, and store access.
//!
//! Nothing here is fatal to the process. The worst local failure is a
//! controller that did not start or stop cleanly, which is reported in the
//! [`ReconcileReport`](crate::ReconcileReport) and logged.

use crate::types::ControllerKey;
use std::fmt;
use thiserror::Error;

/// Convenient result alias for wayfinder.
pub type Result<T> = std::result::Result<T, WayfinderError>;

/// Which lifecycle hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Start,
    Stop,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Start => f.write_str("start"),
            Hook::Stop => f.write_str("stop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WayfinderError {
    /// `derive_params` failed. The controller keeps its previous running
    /// state for this cycle.
    #[error("controller '{key}' failed to derive params: {source}")]
    ParamDerivation {
        key: ControllerKey,
        #[source]
        source: anyhow::Error,
    },

    /// A `start` or `stop` hook failed. Its state mutation was discarded.
    #[error("controller '{key}' {hook} hook failed: {source}")]
    LifecycleHook {
        key: ControllerKey,
        hook: Hook,
        #[source]
        source: anyhow::Error,
    },

    /// No instance is currently running under this key.
    #[error("no running controller '{key}'")]
    UnknownController { key: ControllerKey },

    /// The instance terminated before the command could be delivered.
    #[error("controller '{key}' inbox is closed")]
    ChannelClosed { key: ControllerKey },

    /// Non-blocking delivery found the inbox buffer exhausted.
    #[error("controller '{key}' inbox is full")]
    InboxFull { key: ControllerKey },

    /// A stopped controller attempted to mutate the store.
    #[error("controller '{key}' is stopped; store mutation refused")]
    ControllerStopped { key: ControllerKey },

    #[error("controller key '{key}' registered more than once")]
    DuplicateKey { key: ControllerKey },

    #[error("engine has stopped")]
    EngineStopped,
}

impl WayfinderError {
    /// The controller this error concerns, if any.
    pub fn key(&self) -> Option<&ControllerKey> {
        match self {
            Self::ParamDerivation { key, .. }
            | Self::LifecycleHook { key, .. }
            | Self::UnknownController { key }
            | Self::ChannelClosed { key }
            | Self::InboxFull { key }
            | Self::ControllerStopped { key }
            | Self::DuplicateKey { key } => Some(key),
            Self::EngineStopped => None,
        }
    }

    /// True for the "nobody is listening" outcomes of command delivery.
    ///
    /// A late callback hitting a stopped controller is a normal condition,
    /// so callers usually absorb these.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::UnknownController { .. } | Self::ChannelClosed { .. }
        )
    }
}
