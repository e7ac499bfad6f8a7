//! Testing utilities for Wayfinder.
//!
//! - [`RecordingController`]: a controller built from closures that writes
//!   every lifecycle call and every dispatched command to a [`LifecycleLog`].
//! - [`wait_until`] and [`settle`]: small helpers for waiting on background
//!   processes without hand-rolled sleeps in every test.
//!
//! ```ignore
//! let log = LifecycleLog::new();
//! let orders = RecordingController::new("orders", &log, |route: &Page| {
//!     (route.name == "order-history").then_some(true)
//! });
//!
//! let engine = EngineBuilder::<Page, Journal, Cmd>::new(Journal::new())
//!     .with_controller(orders)
//!     .build()?;
//!
//! engine.reconcile(&Page::new("order-history")).await?;
//! assert_eq!(log.starts("orders"), 1);
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use wayfinder_core::{
    Command, Controller, ControllerContext, ControllerKey, Inbox, Params, Route, State,
};

// ============================================================================
// Lifecycle log
// ============================================================================

/// One observed call into a [`RecordingController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start { key: String, params: String },
    Stop { key: String, params: String },
    Command { key: String, command: String },
    /// The background process returned.
    Exit { key: String },
}

impl LifecycleEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Start { key, .. }
            | Self::Stop { key, .. }
            | Self::Command { key, .. }
            | Self::Exit { key } => key,
        }
    }
}

/// Shared, append-only record of lifecycle events across controllers.
#[derive(Clone, Default)]
pub struct LifecycleLog {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl LifecycleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: LifecycleEvent) {
        self.lock().push(event);
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.lock().clone()
    }

    /// Events that are starts or stops, in order. Commands and exits are
    /// timing-dependent, so most assertions want only these.
    pub fn transitions(&self) -> Vec<LifecycleEvent> {
        self.lock()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Start { .. } | LifecycleEvent::Stop { .. }))
            .cloned()
            .collect()
    }

    pub fn starts(&self, key: &str) -> usize {
        self.count(key, |e| matches!(e, LifecycleEvent::Start { .. }))
    }

    pub fn stops(&self, key: &str) -> usize {
        self.count(key, |e| matches!(e, LifecycleEvent::Stop { .. }))
    }

    pub fn exits(&self, key: &str) -> usize {
        self.count(key, |e| matches!(e, LifecycleEvent::Exit { .. }))
    }

    /// Commands dispatched by `key`'s background processes, in order.
    pub fn commands(&self, key: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Command { key: k, command } if k == key => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn count(&self, key: &str, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| e.key() == key && pred(e)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LifecycleEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LifecycleLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}

// ============================================================================
// Recording controller
// ============================================================================

type DeriveFn<R, P> = dyn Fn(&R) -> anyhow::Result<Option<P>> + Send + Sync;
type HookFn<S, P> = dyn Fn(&P, &mut S) -> anyhow::Result<()> + Send + Sync;

/// A controller assembled from closures that records everything it does.
///
/// The background process is the standard dispatch loop; each command is
/// logged with its `Debug` rendering.
pub struct RecordingController<R, S, P> {
    key: ControllerKey,
    log: LifecycleLog,
    derive: Arc<DeriveFn<R, P>>,
    on_start: Option<Arc<HookFn<S, P>>>,
    on_stop: Option<Arc<HookFn<S, P>>>,
}

impl<R, S, P> RecordingController<R, S, P>
where
    R: Route,
    S: State,
    P: Params,
{
    /// Controller whose params are `derive(route)`.
    pub fn new(
        key: impl Into<ControllerKey>,
        log: &LifecycleLog,
        derive: impl Fn(&R) -> Option<P> + Send + Sync + 'static,
    ) -> Self {
        Self::try_new(key, log, move |route| Ok(derive(route)))
    }

    /// Controller whose param derivation can fail.
    pub fn try_new(
        key: impl Into<ControllerKey>,
        log: &LifecycleLog,
        derive: impl Fn(&R) -> anyhow::Result<Option<P>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            log: log.clone(),
            derive: Arc::new(derive),
            on_start: None,
            on_stop: None,
        }
    }

    /// Run `hook` inside the `start` lifecycle call, after it is logged.
    pub fn on_start(
        mut self,
        hook: impl Fn(&P, &mut S) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Run `hook` inside the `stop` lifecycle call, after it is logged.
    pub fn on_stop(
        mut self,
        hook: impl Fn(&P, &mut S) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    /// Make every `start` fail.
    pub fn failing_start(self) -> Self {
        self.on_start(|_, _| Err(anyhow::anyhow!("start refused")))
    }

    /// Make every `stop` fail.
    pub fn failing_stop(self) -> Self {
        self.on_stop(|_, _| Err(anyhow::anyhow!("stop refused")))
    }

    fn name(&self) -> String {
        self.key.to_string()
    }
}

#[async_trait]
impl<R, S, C, P> Controller<R, S, C> for RecordingController<R, S, P>
where
    R: Route,
    S: State,
    C: Command,
    P: Params,
{
    type Params = P;

    fn key(&self) -> ControllerKey {
        self.key.clone()
    }

    fn derive_params(&self, route: &R) -> anyhow::Result<Option<P>> {
        (self.derive)(route)
    }

    fn start(&self, params: &P, state: &mut S) -> anyhow::Result<()> {
        self.log.record(LifecycleEvent::Start {
            key: self.name(),
            params: format!("{params:?}"),
        });
        match &self.on_start {
            Some(hook) => hook(params, state),
            None => Ok(()),
        }
    }

    fn stop(&self, params: &P, state: &mut S) -> anyhow::Result<()> {
        self.log.record(LifecycleEvent::Stop {
            key: self.name(),
            params: format!("{params:?}"),
        });
        match &self.on_stop {
            Some(hook) => hook(params, state),
            None => Ok(()),
        }
    }

    async fn handle(
        &self,
        _params: P,
        _ctx: ControllerContext<S, C>,
        mut inbox: Inbox<C>,
    ) -> anyhow::Result<()> {
        while let Some(command) = inbox.recv().await {
            self.log.record(LifecycleEvent::Command {
                key: self.name(),
                command: format!("{command:?}"),
            });
        }
        self.log.record(LifecycleEvent::Exit { key: self.name() });
        Ok(())
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// Poll `check` until it holds or `timeout` elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Give spawned background processes a chance to run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
}
