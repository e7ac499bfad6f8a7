//! The shared state store.
//!
//! One mutable tree for the whole application, handed explicitly to every
//! lifecycle hook and background process. The lock covers a single mutation,
//! never a multi-step sequence: two controllers writing the same region race
//! with last-write-wins. Controllers keep to the regions they created.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Handle to the shared state tree.
///
/// Cloning is cheap; every clone points at the same tree.
pub struct Store<S> {
    inner: Arc<Shared<S>>,
}

struct Shared<S> {
    state: RwLock<S>,
    revision: watch::Sender<u64>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Store<S> {
    pub fn new(state: S) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Shared {
                state: RwLock::new(state),
                revision,
            }),
        }
    }

    /// Read the tree under the shared lock.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&*self.read_guard())
    }

    /// Apply one logical mutation under the exclusive lock.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut guard = self.write_guard();
        let out = f(&mut *guard);
        drop(guard);
        self.bump();
        out
    }

    /// Number of committed mutations so far.
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Change notifications. The value is the revision after each commit.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Read-only view for the render layer.
    pub fn reader(&self) -> StoreReader<S> {
        StoreReader {
            store: self.clone(),
        }
    }

    pub(crate) fn write_guard(&self) -> RwLockWriteGuard<'_, S> {
        // A panic inside one mutation must not wedge the store for everyone else.
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, S> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }
}

impl<S: Clone> Store<S> {
    /// Clone of the whole tree.
    pub fn snapshot(&self) -> S {
        self.read(S::clone)
    }

    /// Apply a fallible mutation to a working copy and commit it only on `Ok`.
    ///
    /// A failed attempt leaves the tree exactly as it was.
    pub fn try_mutate<T, E>(&self, f: impl FnOnce(&mut S) -> Result<T, E>) -> Result<T, E> {
        let mut guard = self.write_guard();
        let out = commit_if_ok(&mut *guard, f)?;
        drop(guard);
        self.bump();
        Ok(out)
    }
}

/// Run `f` against a copy of `state`, replacing `state` only when `f` succeeds.
pub(crate) fn commit_if_ok<S: Clone, T, E>(
    state: &mut S,
    f: impl FnOnce(&mut S) -> Result<T, E>,
) -> Result<T, E> {
    let mut working = state.clone();
    let out = f(&mut working)?;
    *state = working;
    Ok(out)
}

/// Read-only handle to the store.
pub struct StoreReader<S> {
    store: Store<S>,
}

impl<S> Clone for StoreReader<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> StoreReader<S> {
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        self.store.read(f)
    }

    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.store.changes()
    }
}

impl<S: Clone> StoreReader<S> {
    pub fn snapshot(&self) -> S {
        self.store.snapshot()
    }
}
