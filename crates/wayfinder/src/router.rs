//! Command routing into running controllers' inboxes.
//!
//! Commands addressed to the same key arrive in submission order. Nothing is
//! promised across keys. A command for a key with no running instance is a
//! normal event (a late HTTP response, a timer firing after navigation) and
//! surfaces as [`WayfinderError::UnknownController`], which
//! [`CommandRouter::dispatch`] absorbs.

use crate::context::CancelSignal;
use crate::error::{Result, WayfinderError};
use crate::types::{Command, ControllerKey};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery endpoint of one running instance.
struct Mailbox<C> {
    sender: mpsc::Sender<C>,
    cancel: CancelSignal,
    instance_id: Uuid,
}

impl<C> Clone for Mailbox<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
            instance_id: self.instance_id,
        }
    }
}

/// Routes commands to running controllers by key.
///
/// Only the reconciler registers and unregisters mailboxes.
pub struct CommandRouter<C> {
    mailboxes: DashMap<ControllerKey, Mailbox<C>>,
}

impl<C: Command> CommandRouter<C> {
    pub(crate) fn new() -> Self {
        Self {
            mailboxes: DashMap::new(),
        }
    }

    pub(crate) fn register(
        &self,
        key: ControllerKey,
        sender: mpsc::Sender<C>,
        cancel: CancelSignal,
        instance_id: Uuid,
    ) {
        self.mailboxes.insert(
            key,
            Mailbox {
                sender,
                cancel,
                instance_id,
            },
        );
    }

    /// Drop the mailbox for `key` if it still belongs to `instance_id`.
    pub(crate) fn unregister(&self, key: &str, instance_id: Uuid) -> bool {
        self.mailboxes
            .remove_if(key, |_, mailbox| mailbox.instance_id == instance_id)
            .is_some()
    }

    /// Whether an instance is currently registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.mailboxes.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ControllerKey> {
        let mut keys: Vec<_> = self.mailboxes.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Deliver `command` to the controller running under `key`.
    ///
    /// Waits while the inbox buffer is full rather than dropping the command.
    /// If the instance is stopped while we wait, the send fails with
    /// [`WayfinderError::ChannelClosed`] instead of hanging.
    pub async fn send(&self, key: &str, command: C) -> Result<()> {
        let mailbox = self.mailbox(key)?;
        if mailbox.cancel.is_cancelled() {
            return Err(WayfinderError::ChannelClosed { key: key.into() });
        }

        let sent = tokio::select! {
            biased;
            sent = mailbox.sender.send(command) => sent.is_ok(),
            _ = mailbox.cancel.cancelled() => false,
        };

        // A stop that lands after the check above still discards the buffer.
        if !sent || mailbox.cancel.is_cancelled() {
            return Err(WayfinderError::ChannelClosed { key: key.into() });
        }
        Ok(())
    }

    /// Deliver without waiting. A full buffer yields [`WayfinderError::InboxFull`].
    pub fn try_send(&self, key: &str, command: C) -> Result<()> {
        let mailbox = self.mailbox(key)?;
        if mailbox.cancel.is_cancelled() {
            return Err(WayfinderError::ChannelClosed { key: key.into() });
        }

        mailbox.sender.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => WayfinderError::InboxFull { key: key.into() },
            TrySendError::Closed(_) => WayfinderError::ChannelClosed { key: key.into() },
        })
    }

    /// Deliver and absorb routing failures.
    ///
    /// This is the boundary used by external I/O callbacks: nothing it does
    /// can fail the caller.
    pub async fn dispatch(&self, key: &str, command: C) {
        if let Err(err) = self.send(key, command).await {
            if err.is_routing() {
                debug!(key, error = %err, "command dropped: controller not running");
            } else {
                warn!(key, error = %err, "command dropped");
            }
        }
    }

    fn mailbox(&self, key: &str) -> Result<Mailbox<C>> {
        // Clone out so no map guard is held across an await.
        self.mailboxes
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WayfinderError::UnknownController { key: key.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelHandle;
    use std::sync::Arc;
    use std::time::Duration;

    fn mailbox(
        router: &CommandRouter<u32>,
        key: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<u32>, CancelHandle, Uuid) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancelHandle::new();
        let id = Uuid::new_v4();
        router.register(key.into(), tx, cancel.signal(), id);
        (rx, cancel, id)
    }

    #[tokio::test]
    async fn send_to_unknown_key_fails_with_unknown_controller() {
        let router = CommandRouter::<u32>::new();

        let err = router.send("orders", 1).await.unwrap_err();
        assert!(matches!(err, WayfinderError::UnknownController { .. }));
    }

    #[tokio::test]
    async fn dispatch_to_unknown_key_is_absorbed() {
        let router = CommandRouter::<u32>::new();
        router.dispatch("nobody", 1).await;
    }

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let router = CommandRouter::new();
        let (mut rx, _cancel, _) = mailbox(&router, "orders", 8);

        for n in 1..=3 {
            router.send("orders", n).await.unwrap();
        }

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn try_send_reports_full_inbox() {
        let router = CommandRouter::new();
        let (_rx, _cancel, _) = mailbox(&router, "orders", 1);

        router.try_send("orders", 1).unwrap();
        let err = router.try_send("orders", 2).unwrap_err();
        assert!(matches!(err, WayfinderError::InboxFull { .. }));
    }

    #[tokio::test]
    async fn blocked_sender_is_released_on_cancel() {
        let router = Arc::new(CommandRouter::new());
        let (_rx, cancel, _) = mailbox(&router, "orders", 1);
        router.send("orders", 1).await.unwrap();

        let blocked = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.send("orders", 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("sender should not deadlock")
            .unwrap();
        assert!(matches!(result, Err(WayfinderError::ChannelClosed { .. })));
    }

    #[tokio::test]
    async fn stopped_instance_with_room_refuses_delivery() {
        let router = CommandRouter::<u32>::new();
        let (_rx, cancel, _) = mailbox(&router, "orders", 8);
        router.send("orders", 1).await.unwrap();

        // Still registered, buffer has room, but the instance was told to stop.
        cancel.cancel();

        let err = router.send("orders", 2).await.unwrap_err();
        assert!(matches!(err, WayfinderError::ChannelClosed { .. }));
        let err = router.try_send("orders", 3).unwrap_err();
        assert!(matches!(err, WayfinderError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn unregister_ignores_stale_instance() {
        let router = CommandRouter::<u32>::new();
        let (_rx_old, _c1, old_id) = mailbox(&router, "orders", 1);
        let (_rx_new, _c2, _new_id) = mailbox(&router, "orders", 1);

        assert!(!router.unregister("orders", old_id));
        assert!(router.contains("orders"));
    }
}
