//! Engine: the entry point that wires the store, the reconciler and the
//! command router together, and drives reconciliation from route changes.

use crate::config::EngineConfig;
use crate::context::Emitted;
use crate::controller::{Controller, DynController, Erased};
use crate::error::{Result, WayfinderError};
use crate::instance::ControllerStatus;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::router::CommandRouter;
use crate::store::{Store, StoreReader};
use crate::types::{Command, ControllerKey, Route, State};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Builder for creating an [`Engine`].
///
/// Controllers can only be registered here. Once built, the set is fixed.
pub struct EngineBuilder<R, S, C> {
    state: S,
    config: EngineConfig,
    controllers: Vec<Box<dyn DynController<R, S, C>>>,
}

impl<R, S, C> EngineBuilder<R, S, C>
where
    R: Route,
    S: State,
    C: Command,
{
    /// Create a builder around the initial state tree.
    pub fn new(state: S) -> Self {
        Self {
            state,
            config: EngineConfig::default(),
            controllers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a controller. Reconciliation visits controllers in
    /// registration order within each phase.
    pub fn with_controller<T>(mut self, controller: T) -> Self
    where
        T: Controller<R, S, C>,
    {
        self.controllers.push(Box::new(Erased::new(controller)));
        self
    }

    /// Build the engine. Fails if two controllers share a key.
    pub fn build(self) -> Result<Engine<R, S, C>> {
        let mut seen = HashSet::new();
        for controller in &self.controllers {
            let key = controller.key();
            if !seen.insert(key.clone()) {
                return Err(WayfinderError::DuplicateKey { key });
            }
        }

        let config = self.config.normalized();
        let store = Store::new(self.state);
        let router = Arc::new(CommandRouter::new());
        let (bus, _) = broadcast::channel(config.emitted_capacity);
        let reconciler = Reconciler::new(
            self.controllers,
            store.clone(),
            Arc::clone(&router),
            bus.clone(),
            config.inbox_capacity,
        );

        Ok(Engine {
            shared: Arc::new(Shared {
                reconciler: Mutex::new(reconciler),
                closed: AtomicBool::new(false),
                store,
                router,
                bus,
                config,
            }),
        })
    }
}

struct Shared<R, S, C> {
    /// Serializes reconciliation passes.
    reconciler: Mutex<Reconciler<R, S, C>>,
    closed: AtomicBool,
    store: Store<S>,
    router: Arc<CommandRouter<C>>,
    bus: broadcast::Sender<Emitted<C>>,
    config: EngineConfig,
}

impl<R, S, C> Shared<R, S, C>
where
    R: Route,
    S: State,
    C: Command,
{
    async fn reconcile(&self, route: &R) -> Result<ReconcileReport> {
        let mut reconciler = self.reconciler.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(WayfinderError::EngineStopped);
        }
        Ok(reconciler.reconcile(route))
    }
}

/// A built engine that has not started its route driver yet.
///
/// [`Engine::reconcile`] can be called directly, e.g. for server-side or
/// test usage. [`Engine::start`] spawns the route driver and returns a
/// cloneable [`EngineHandle`].
pub struct Engine<R, S, C> {
    shared: Arc<Shared<R, S, C>>,
}

impl<R, S, C> Engine<R, S, C>
where
    R: Route,
    S: State,
    C: Command,
{
    /// Reconcile against `route` now. Passes never overlap.
    pub async fn reconcile(&self, route: &R) -> Result<ReconcileReport> {
        self.shared.reconcile(route).await
    }

    pub fn store(&self) -> StoreReader<S> {
        self.shared.store.reader()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn router(&self) -> Arc<CommandRouter<C>> {
        Arc::clone(&self.shared.router)
    }

    /// Running controllers, sorted by key.
    pub async fn running(&self) -> Vec<ControllerStatus> {
        self.shared.reconciler.lock().await.running()
    }

    /// Spawn the route driver.
    pub fn start(self) -> EngineHandle<R, S, C> {
        let (routes, routes_rx) = watch::channel(None);
        let (applied_tx, applied) = watch::channel(AppliedRoute {
            generation: 0,
            report: Arc::new(ReconcileReport::default()),
        });
        let (stop, stop_rx) = watch::channel(false);

        let driver = tokio::spawn(
            drive_routes(Arc::clone(&self.shared), routes_rx, applied_tx, stop_rx)
                .instrument(tracing::info_span!("route_driver")),
        );
        info!("engine started");

        EngineHandle {
            shared: self.shared,
            driver: Arc::new(Driver {
                routes,
                applied,
                stop,
                task: StdMutex::new(Some(driver)),
            }),
        }
    }
}

/// The latest route the driver has finished reconciling.
#[derive(Debug, Clone)]
pub struct AppliedRoute {
    /// Generation returned by [`EngineHandle::navigate`]. Zero before the
    /// first pass.
    pub generation: u64,
    pub report: Arc<ReconcileReport>,
}

/// Reconcile the latest route each time it changes.
///
/// Routes that arrive while a pass is running overwrite each other in the
/// watch slot, so a burst collapses into its final route, which is always
/// reconciled.
async fn drive_routes<R, S, C>(
    shared: Arc<Shared<R, S, C>>,
    mut routes: watch::Receiver<Option<(u64, R)>>,
    applied: watch::Sender<AppliedRoute>,
    mut stop: watch::Receiver<bool>,
) where
    R: Route,
    S: State,
    C: Command,
{
    let mut last_generation = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            changed = routes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some((generation, route)) = routes.borrow_and_update().clone() else {
            continue;
        };
        if generation > last_generation + 1 {
            trace!(
                skipped = generation - last_generation - 1,
                generation,
                "coalesced intermediate routes"
            );
        }

        match shared.reconcile(&route).await {
            Ok(report) => {
                last_generation = generation;
                applied.send_replace(AppliedRoute {
                    generation,
                    report: Arc::new(report),
                });
            }
            Err(err) => {
                debug!(error = %err, "route driver exiting");
                break;
            }
        }
    }
}

struct Driver<R> {
    routes: watch::Sender<Option<(u64, R)>>,
    applied: watch::Receiver<AppliedRoute>,
    stop: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to a running engine.
///
/// Cheap to clone; hand it to the router collaborator, to I/O callbacks,
/// and to the render layer.
pub struct EngineHandle<R, S, C> {
    shared: Arc<Shared<R, S, C>>,
    driver: Arc<Driver<R>>,
}

impl<R, S, C> Clone for EngineHandle<R, S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            driver: Arc::clone(&self.driver),
        }
    }
}

impl<R, S, C> EngineHandle<R, S, C>
where
    R: Route,
    S: State,
    C: Command,
{
    /// Hand a new route to the driver without waiting.
    ///
    /// Returns the route's generation. Intermediate routes in a burst may
    /// be skipped; the last one is always reconciled.
    pub fn navigate(&self, route: R) -> u64 {
        let mut generation = 0;
        self.driver.routes.send_modify(|slot| {
            generation = slot.as_ref().map_or(0, |(previous, _)| *previous) + 1;
            *slot = Some((generation, route));
        });
        generation
    }

    /// Navigate, then wait until a pass at or after this route has been
    /// applied.
    ///
    /// The report returned belongs to that pass, which may be for a later
    /// route if this one was coalesced away.
    pub async fn navigate_and_await(&self, route: R) -> Result<Arc<ReconcileReport>> {
        let generation = self.navigate(route);
        self.wait_for_generation(generation).await
    }

    /// Wait until the driver has applied `generation` or a later one.
    pub async fn wait_for_generation(&self, generation: u64) -> Result<Arc<ReconcileReport>> {
        let mut applied = self.driver.applied.clone();
        let applied = applied
            .wait_for(|applied| applied.generation >= generation)
            .await
            .map_err(|_| WayfinderError::EngineStopped)?;
        Ok(Arc::clone(&applied.report))
    }

    /// Reconcile directly, bypassing the driver. Serialized with it.
    pub async fn reconcile(&self, route: &R) -> Result<ReconcileReport> {
        self.shared.reconcile(route).await
    }

    /// Deliver a command to a running controller, preserving per-key order.
    pub async fn send(&self, key: &str, command: C) -> Result<()> {
        self.shared.router.send(key, command).await
    }

    pub fn try_send(&self, key: &str, command: C) -> Result<()> {
        self.shared.router.try_send(key, command)
    }

    /// Deliver and absorb routing failures. For I/O callbacks.
    pub async fn dispatch(&self, key: &str, command: C) {
        self.shared.router.dispatch(key, command).await
    }

    pub fn router(&self) -> Arc<CommandRouter<C>> {
        Arc::clone(&self.shared.router)
    }

    /// Read-only view of the state tree for the render layer.
    pub fn store(&self) -> StoreReader<S> {
        self.shared.store.reader()
    }

    /// Records published through `Outbox::emit`.
    pub fn subscribe(&self) -> broadcast::Receiver<Emitted<C>> {
        self.shared.bus.subscribe()
    }

    /// The most recent pass applied by the driver.
    pub fn reports(&self) -> watch::Receiver<AppliedRoute> {
        self.driver.applied.clone()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.shared.router.contains(key)
    }

    pub async fn running(&self) -> Vec<ControllerStatus> {
        self.shared.reconciler.lock().await.running()
    }

    pub async fn running_keys(&self) -> Vec<ControllerKey> {
        self.running().await.into_iter().map(|s| s.key).collect()
    }

    /// Stop the driver and every controller.
    ///
    /// Background processes get `shutdown_grace` to exit. Any still running
    /// after that are left detached, never aborted.
    pub async fn shutdown(&self) -> ReconcileReport {
        self.driver.stop.send_replace(true);
        let driver = self
            .driver
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        let (report, lingering) = {
            let mut reconciler = self.shared.reconciler.lock().await;
            self.shared.closed.store(true, Ordering::Release);
            reconciler.shutdown()
        };

        if let Some(grace) = self.shared.config.shutdown_grace() {
            let deadline = tokio::time::Instant::now() + grace;
            for (key, task) in lingering {
                if tokio::time::timeout_at(deadline, task).await.is_err() {
                    warn!(key = %key, "controller still running after shutdown grace; detaching");
                }
            }
        }

        info!(stopped = report.stopped.len(), "engine stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ControllerContext;
    use async_trait::async_trait;
    use std::time::Duration;

    type Log = Vec<String>;

    struct Page(&'static str);

    #[async_trait]
    impl Controller<&'static str, Log, String> for Page {
        type Params = ();

        fn key(&self) -> ControllerKey {
            self.0.into()
        }

        fn derive_params(&self, route: &&'static str) -> anyhow::Result<Option<()>> {
            Ok((*route == self.0).then_some(()))
        }

        fn start(&self, _: &(), state: &mut Log) -> anyhow::Result<()> {
            state.push(format!("start {}", self.0));
            Ok(())
        }

        fn stop(&self, _: &(), state: &mut Log) -> anyhow::Result<()> {
            state.push(format!("stop {}", self.0));
            Ok(())
        }

        async fn on_command(
            &self,
            _: &(),
            command: String,
            ctx: &ControllerContext<Log, String>,
        ) -> anyhow::Result<()> {
            ctx.store().mutate(|s| s.push(command))?;
            Ok(())
        }
    }

    fn engine() -> Engine<&'static str, Log, String> {
        EngineBuilder::new(Log::new())
            .with_controller(Page("home"))
            .with_controller(Page("orders"))
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = EngineBuilder::<&'static str, Log, String>::new(Log::new())
            .with_controller(Page("orders"))
            .with_controller(Page("orders"))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, WayfinderError::DuplicateKey { ref key } if key == "orders"));
    }

    #[tokio::test]
    async fn direct_reconcile_without_driver() {
        let engine = engine();
        let report = engine.reconcile(&"orders").await.unwrap();

        assert_eq!(report.started, vec![ControllerKey::from("orders")]);
        assert_eq!(engine.store().snapshot(), vec!["start orders"]);
    }

    #[tokio::test]
    async fn navigate_and_await_applies_route() {
        let handle = engine().start();

        let report = handle.navigate_and_await("home").await.unwrap();
        assert_eq!(report.started, vec![ControllerKey::from("home")]);
        assert!(handle.is_running("home"));

        let report = handle.navigate_and_await("orders").await.unwrap();
        assert_eq!(report.stopped, vec![ControllerKey::from("home")]);
        assert_eq!(report.started, vec![ControllerKey::from("orders")]);
        assert_eq!(handle.running_keys().await, vec![ControllerKey::from("orders")]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn burst_of_routes_ends_on_the_final_route() {
        let handle = engine().start();

        let mut last = 0;
        for route in ["home", "orders", "home", "orders", "home"] {
            last = handle.navigate(route);
        }
        handle.wait_for_generation(last).await.unwrap();

        assert_eq!(handle.running_keys().await, vec![ControllerKey::from("home")]);
        assert_eq!(handle.reports().borrow().generation, last);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn commands_reach_running_controller() {
        let handle = engine().start();
        handle.navigate_and_await("orders").await.unwrap();

        handle.send("orders", "loaded".to_string()).await.unwrap();

        let store = handle.store();
        let mut changes = store.changes();
        tokio::time::timeout(
            Duration::from_secs(1),
            changes.wait_for(|_| store.read(|s| s.contains(&"loaded".to_string()))),
        )
        .await
        .unwrap()
        .unwrap();

        let err = handle.send("home", "x".to_string()).await.unwrap_err();
        assert!(err.is_routing());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_controllers_and_refuses_more_work() {
        let handle = engine().start();
        handle.navigate_and_await("orders").await.unwrap();

        let report = handle.shutdown().await;
        assert_eq!(report.stopped, vec![ControllerKey::from("orders")]);
        assert!(!handle.is_running("orders"));

        assert!(matches!(
            handle.reconcile(&"home").await,
            Err(WayfinderError::EngineStopped)
        ));
        assert!(matches!(
            handle.navigate_and_await("home").await,
            Err(WayfinderError::EngineStopped)
        ));
        assert_eq!(handle.store().snapshot(), vec!["start orders", "stop orders"]);
    }
}
