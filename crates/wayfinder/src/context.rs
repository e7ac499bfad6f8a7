//! What a running controller's background process is handed: its inbox, its
//! outbox, a cancellation-aware store handle, and the stop signal.

use crate::error::{Result, WayfinderError};
use crate::router::CommandRouter;
use crate::store::{commit_if_ok, Store};
use crate::types::{Command, ControllerKey, State};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

// ============================================================================
// Cancellation
// ============================================================================

/// Owner side of a controller's cooperative stop flag.
pub(crate) struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Idempotent.
    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observer side of a controller's stop flag.
#[derive(Clone)]
pub(crate) struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set, or once the owner is gone.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the handle was dropped with its instance, which is a stop too.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Inbound command channel of one running instance.
pub struct Inbox<C> {
    rx: mpsc::Receiver<C>,
    cancel: CancelSignal,
}

impl<C: Command> Inbox<C> {
    pub(crate) fn new(rx: mpsc::Receiver<C>, cancel: CancelSignal) -> Self {
        Self { rx, cancel }
    }

    /// Next command, or `None` once the controller has been told to stop.
    ///
    /// The stop flag is checked before every read and wins over buffered
    /// commands. On termination the channel is closed so blocked senders
    /// are released.
    pub async fn recv(&mut self) -> Option<C> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            command = self.rx.recv() => command,
        };

        if next.is_none() {
            self.rx.close();
        }
        next
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// A command published on the engine-wide bus by a running controller.
#[derive(Debug, Clone)]
pub struct Emitted<C> {
    pub from: ControllerKey,
    pub instance_id: Uuid,
    pub command: C,
}

/// Outbound conduit of one running instance.
pub struct Outbox<C> {
    key: ControllerKey,
    instance_id: Uuid,
    own: mpsc::Sender<C>,
    bus: broadcast::Sender<Emitted<C>>,
    router: Arc<CommandRouter<C>>,
}

impl<C> Clone for Outbox<C> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            instance_id: self.instance_id,
            own: self.own.clone(),
            bus: self.bus.clone(),
            router: Arc::clone(&self.router),
        }
    }
}

impl<C: Command> Outbox<C> {
    pub(crate) fn new(
        key: ControllerKey,
        instance_id: Uuid,
        own: mpsc::Sender<C>,
        bus: broadcast::Sender<Emitted<C>>,
        router: Arc<CommandRouter<C>>,
    ) -> Self {
        Self {
            key,
            instance_id,
            own,
            bus,
            router,
        }
    }

    /// Publish on the engine-wide bus. Returns how many subscribers saw it.
    pub fn emit(&self, command: C) -> usize {
        self.bus
            .send(Emitted {
                from: self.key.clone(),
                instance_id: self.instance_id,
                command,
            })
            .unwrap_or(0)
    }

    /// Queue a command on this controller's own inbox.
    ///
    /// Never waits: the caller is usually the loop that drains the inbox.
    pub fn schedule(&self, command: C) -> Result<()> {
        self.own.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WayfinderError::InboxFull {
                key: self.key.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => WayfinderError::ChannelClosed {
                key: self.key.clone(),
            },
        })
    }

    /// Deliver to another running controller.
    pub async fn send_to(&self, key: &str, command: C) -> Result<()> {
        self.router.send(key, command).await
    }

    /// Deliver to this controller's key after `delay`.
    ///
    /// If the controller is no longer running by then, the command is
    /// dropped and logged. A restarted controller under the same key
    /// receives it.
    pub fn send_after(&self, delay: Duration, command: C) {
        let router = Arc::clone(&self.router);
        let key = self.key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            router.dispatch(key.as_str(), command).await;
        });
    }
}

// ============================================================================
// Store access
// ============================================================================

/// Store handle that turns inert once its controller is stopped.
///
/// The stop flag is checked while holding the write lock, so once the
/// reconciler has signalled a stop and run the `stop` hook, nothing written
/// by the old background process can land after it.
pub struct ScopedStore<S> {
    store: Store<S>,
    key: ControllerKey,
    cancel: CancelSignal,
}

impl<S> Clone for ScopedStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: State> ScopedStore<S> {
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        self.store.read(f)
    }

    pub fn snapshot(&self) -> S {
        self.store.snapshot()
    }

    pub fn mutate<T>(&self, f: impl FnOnce(&mut S) -> T) -> Result<T> {
        let mut guard = self.store.write_guard();
        if self.cancel.is_cancelled() {
            return Err(self.stopped());
        }
        let out = f(&mut *guard);
        drop(guard);
        self.store.bump();
        Ok(out)
    }

    /// Like [`Store::try_mutate`]; a failed closure leaves the tree untouched.
    pub fn try_mutate<T>(&self, f: impl FnOnce(&mut S) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut guard = self.store.write_guard();
        if self.cancel.is_cancelled() {
            return Err(self.stopped().into());
        }
        let out = commit_if_ok(&mut *guard, f)?;
        drop(guard);
        self.store.bump();
        Ok(out)
    }

    fn stopped(&self) -> WayfinderError {
        WayfinderError::ControllerStopped {
            key: self.key.clone(),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Everything a background process needs besides its inbox.
pub struct ControllerContext<S, C> {
    key: ControllerKey,
    instance_id: Uuid,
    store: ScopedStore<S>,
    outbox: Outbox<C>,
    cancel: CancelSignal,
}

impl<S, C> Clone for ControllerContext<S, C> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            instance_id: self.instance_id,
            store: self.store.clone(),
            outbox: self.outbox.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: State, C: Command> ControllerContext<S, C> {
    pub(crate) fn new(
        key: ControllerKey,
        instance_id: Uuid,
        store: Store<S>,
        outbox: Outbox<C>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            store: ScopedStore {
                store,
                key: key.clone(),
                cancel: cancel.clone(),
            },
            key,
            instance_id,
            outbox,
            cancel,
        }
    }

    pub fn key(&self) -> &ControllerKey {
        &self.key
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn store(&self) -> &ScopedStore<S> {
        &self.store
    }

    pub fn outbox(&self) -> &Outbox<C> {
        &self.outbox
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the reconciler stops this instance.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }
}
