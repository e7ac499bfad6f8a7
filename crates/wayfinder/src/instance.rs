//! Running controller instances.

use crate::context::CancelHandle;
use crate::types::{AnyParams, ControllerKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A controller that is currently running.
///
/// Never mutated in place: a restart destroys this and creates a new one.
pub(crate) struct ControllerInstance {
    pub(crate) key: ControllerKey,
    pub(crate) instance_id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) params: Box<dyn AnyParams>,
    pub(crate) cancel: CancelHandle,
    pub(crate) task: JoinHandle<()>,
}

impl ControllerInstance {
    pub(crate) fn status(&self) -> ControllerStatus {
        ControllerStatus {
            key: self.key.clone(),
            instance_id: self.instance_id,
            started_at: self.started_at,
            params: format!("{:?}", self.params),
        }
    }
}

/// Point-in-time view of a running controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub key: ControllerKey,
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// `Debug` rendering of the params the instance is running with.
    pub params: String,
}
