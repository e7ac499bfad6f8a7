//! The reconciler: keeps the set of running controllers consistent with the
//! current route.
//!
//! Every route, the first one included, goes through the same diff against
//! the running set, so the same route always yields the same running
//! controllers whatever the navigation history was.

use crate::context::{CancelHandle, ControllerContext, Emitted, Inbox, Outbox};
use crate::controller::DynController;
use crate::diff::{diff, Transition};
use crate::error::{Hook, WayfinderError};
use crate::instance::{ControllerInstance, ControllerStatus};
use crate::router::CommandRouter;
use crate::store::Store;
use crate::types::{AnyParams, Command, ControllerKey, Route, State};
use chrono::Utc;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one reconciliation pass.
///
/// A restart is listed only under `restarted`. A restart whose new `start`
/// failed leaves the controller stopped and is listed under `stopped`.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub started: Vec<ControllerKey>,
    pub stopped: Vec<ControllerKey>,
    pub restarted: Vec<ControllerKey>,
    pub errors: Vec<WayfinderError>,
}

impl ReconcileReport {
    /// Nothing was started, stopped or restarted.
    pub fn is_noop(&self) -> bool {
        self.action_count() == 0
    }

    /// No controller reported an error.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.started.len() + self.stopped.len() + self.restarted.len()
    }
}

struct Registered<R, S, C> {
    key: ControllerKey,
    controller: Box<dyn DynController<R, S, C>>,
}

/// One controller's pending action for the current pass.
struct Planned {
    index: usize,
    transition: Transition,
    next: Option<Box<dyn AnyParams>>,
}

pub(crate) struct Reconciler<R, S, C> {
    controllers: Vec<Registered<R, S, C>>,
    running: HashMap<ControllerKey, ControllerInstance>,
    /// Background processes of stopped instances that may still be winding down.
    lingering: Vec<(ControllerKey, JoinHandle<()>)>,
    store: Store<S>,
    router: Arc<CommandRouter<C>>,
    bus: broadcast::Sender<Emitted<C>>,
    inbox_capacity: usize,
}

impl<R, S, C> Reconciler<R, S, C>
where
    R: Route,
    S: State,
    C: Command,
{
    pub(crate) fn new(
        controllers: Vec<Box<dyn DynController<R, S, C>>>,
        store: Store<S>,
        router: Arc<CommandRouter<C>>,
        bus: broadcast::Sender<Emitted<C>>,
        inbox_capacity: usize,
    ) -> Self {
        Self {
            controllers: controllers
                .into_iter()
                .map(|controller| Registered {
                    key: controller.key(),
                    controller,
                })
                .collect(),
            running: HashMap::new(),
            lingering: Vec::new(),
            store,
            router,
            bus,
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Bring the running set in line with `route`.
    ///
    /// All stops in the pass run before any start, so resources released by
    /// one controller are free before another acquires them. A failure in one
    /// controller never prevents the others from being reconciled.
    pub(crate) fn reconcile(&mut self, route: &R) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut plan: SmallVec<[Planned; 8]> = SmallVec::new();

        for (index, registered) in self.controllers.iter().enumerate() {
            let derived = guarded("derive_params", || registered.controller.derive_params(route));
            let next = match derived {
                Ok(next) => next,
                Err(source) => {
                    warn!(key = %registered.key, error = %source, "param derivation failed; keeping previous state");
                    report.errors.push(WayfinderError::ParamDerivation {
                        key: registered.key.clone(),
                        source,
                    });
                    continue;
                }
            };

            let previous = self.running.get(&registered.key).map(|i| &*i.params);
            let transition = diff(previous, next.as_deref());
            if transition != Transition::Unchanged {
                plan.push(Planned {
                    index,
                    transition,
                    next,
                });
            }
        }

        for planned in plan.iter().filter(|p| p.transition.stops()) {
            self.stop_instance(planned.index, &mut report);
        }

        for planned in plan.into_iter().filter(|p| p.transition.starts()) {
            let Some(params) = planned.next else { continue };
            let key = self.controllers[planned.index].key.clone();
            let started = self.start_instance(planned.index, params, &mut report);

            match (planned.transition, started) {
                (Transition::Restart, true) => {
                    info!(key = %key, "controller restarted");
                    // Reported once, as a restart rather than a stop plus a start.
                    report.stopped.retain(|k| *k != key);
                    report.restarted.push(key);
                }
                (_, true) => report.started.push(key),
                (_, false) => {}
            }
        }

        self.lingering.retain(|(_, task)| !task.is_finished());

        if !report.is_noop() || !report.is_clean() {
            debug!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                restarted = report.restarted.len(),
                errors = report.errors.len(),
                running = self.running.len(),
                "reconciled"
            );
        }
        report
    }

    /// Stop every running controller and hand back the background processes
    /// that have not exited yet.
    pub(crate) fn shutdown(&mut self) -> (ReconcileReport, Vec<(ControllerKey, JoinHandle<()>)>) {
        let mut report = ReconcileReport::default();
        for index in 0..self.controllers.len() {
            if self.running.contains_key(&self.controllers[index].key) {
                self.stop_instance(index, &mut report);
            }
        }

        let lingering = std::mem::take(&mut self.lingering)
            .into_iter()
            .filter(|(_, task)| !task.is_finished())
            .collect();
        (report, lingering)
    }

    pub(crate) fn running(&self) -> Vec<ControllerStatus> {
        let mut status: Vec<_> = self.running.values().map(|i| i.status()).collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }

    pub(crate) fn is_running(&self, key: &str) -> bool {
        self.running.contains_key(key)
    }

    /// Signal termination, then run `stop` with the last applied params.
    ///
    /// The instance leaves the running set whatever the hook returns.
    fn stop_instance(&mut self, index: usize, report: &mut ReconcileReport) {
        let registered = &self.controllers[index];
        let Some(instance) = self.running.remove(&registered.key) else {
            return;
        };

        self.router.unregister(instance.key.as_str(), instance.instance_id);
        // Cancel before the hook: the old process's store handle is refused
        // from here on, so the hook's cleanup is the last word.
        instance.cancel.cancel();

        let stopped = self.store.try_mutate(|state| {
            guarded("stop", || registered.controller.stop(&*instance.params, state))
        });

        match stopped {
            Ok(()) => info!(
                key = %instance.key,
                instance_id = %instance.instance_id,
                params = ?instance.params,
                "controller stopped"
            ),
            Err(source) => {
                error!(key = %instance.key, instance_id = %instance.instance_id, error = %source, "stop hook failed; instance removed");
                report.errors.push(WayfinderError::LifecycleHook {
                    key: instance.key.clone(),
                    hook: Hook::Stop,
                    source,
                });
            }
        }

        report.stopped.push(instance.key.clone());
        if !instance.task.is_finished() {
            self.lingering.push((instance.key, instance.task));
        }
    }

    /// Run `start`, then launch the background process.
    ///
    /// Returns false when the hook failed, in which case nothing was created
    /// and the hook's mutation was discarded.
    fn start_instance(
        &mut self,
        index: usize,
        params: Box<dyn AnyParams>,
        report: &mut ReconcileReport,
    ) -> bool {
        let registered = &self.controllers[index];
        let key = registered.key.clone();

        let started = self.store.try_mutate(|state| {
            guarded("start", || registered.controller.start(&*params, state))
        });
        if let Err(source) = started {
            error!(key = %key, params = ?params, error = %source, "start hook failed; controller not started");
            report.errors.push(WayfinderError::LifecycleHook {
                key,
                hook: Hook::Start,
                source,
            });
            return false;
        }

        let instance_id = Uuid::new_v4();
        let cancel = CancelHandle::new();
        let (tx, rx) = mpsc::channel(self.inbox_capacity);

        // Commands routed before the process is polled wait in the inbox.
        self.router
            .register(key.clone(), tx.clone(), cancel.signal(), instance_id);

        let outbox = Outbox::new(
            key.clone(),
            instance_id,
            tx,
            self.bus.clone(),
            Arc::clone(&self.router),
        );
        let ctx = ControllerContext::new(
            key.clone(),
            instance_id,
            self.store.clone(),
            outbox,
            cancel.signal(),
        );
        let task = registered
            .controller
            .spawn(&*params, ctx, Inbox::new(rx, cancel.signal()));

        info!(key = %key, instance_id = %instance_id, params = ?params, "controller started");

        self.running.insert(
            key.clone(),
            ControllerInstance {
                key,
                instance_id,
                started_at: Utc::now(),
                params,
                cancel,
                task,
            },
        );
        true
    }
}

/// Run a synchronous controller hook, turning a panic into an error.
///
/// The hook runs inside `Store::try_mutate`, so a caught panic discards the
/// working copy like any other failure and never poisons the store lock.
fn guarded<T>(hook: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("{hook} panicked: {}", panic_message(&*payload)))
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Controller, Erased};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Nav {
        page: &'static str,
        id: u32,
    }

    fn nav(page: &'static str, id: u32) -> Nav {
        Nav { page, id }
    }

    /// State is an append-only journal of hook calls.
    type Journal = Vec<String>;

    struct PageController {
        key: &'static str,
        page: &'static str,
        fail_start: bool,
        fail_stop: bool,
        /// Hook that panics instead of returning: "derive", "start" or "stop".
        panic_in: Option<&'static str>,
        derive_calls: Arc<Mutex<u32>>,
    }

    impl PageController {
        fn new(key: &'static str, page: &'static str) -> Self {
            Self {
                key,
                page,
                fail_start: false,
                fail_stop: false,
                panic_in: None,
                derive_calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Controller<Nav, Journal, u32> for PageController {
        type Params = u32;

        fn key(&self) -> ControllerKey {
            self.key.into()
        }

        fn derive_params(&self, route: &Nav) -> anyhow::Result<Option<u32>> {
            *self.derive_calls.lock().unwrap() += 1;
            if self.panic_in == Some("derive") && route.page == self.page {
                panic!("route table corrupted");
            }
            if route.page == "broken" {
                bail!("cannot parse route");
            }
            Ok((route.page == self.page).then_some(route.id))
        }

        fn start(&self, params: &u32, state: &mut Journal) -> anyhow::Result<()> {
            state.push(format!("start {} {}", self.key, params));
            if self.panic_in == Some("start") {
                panic!("socket already bound");
            }
            if self.fail_start {
                bail!("start refused");
            }
            Ok(())
        }

        fn stop(&self, params: &u32, state: &mut Journal) -> anyhow::Result<()> {
            state.push(format!("stop {} {}", self.key, params));
            if self.panic_in == Some("stop") {
                panic!("double close");
            }
            if self.fail_stop {
                bail!("stop refused");
            }
            Ok(())
        }
    }

    fn reconciler(controllers: Vec<PageController>) -> (Reconciler<Nav, Journal, u32>, Store<Journal>) {
        let store = Store::new(Journal::new());
        let (bus, _) = broadcast::channel(8);
        let controllers = controllers
            .into_iter()
            .map(|c| Box::new(Erased::new(c)) as Box<dyn DynController<Nav, Journal, u32>>)
            .collect();
        let reconciler = Reconciler::new(
            controllers,
            store.clone(),
            Arc::new(CommandRouter::new()),
            bus,
            4,
        );
        (reconciler, store)
    }

    #[tokio::test]
    async fn start_then_noop_then_stop() {
        let (mut r, store) = reconciler(vec![PageController::new("orders", "order-history")]);

        let report = r.reconcile(&nav("home", 0));
        assert!(report.is_noop());

        let report = r.reconcile(&nav("order-history", 1));
        assert_eq!(report.started, vec![ControllerKey::from("orders")]);
        assert!(r.is_running("orders"));
        assert!(r.router.contains("orders"));

        let report = r.reconcile(&nav("order-history", 1));
        assert!(report.is_noop());

        let report = r.reconcile(&nav("home", 0));
        assert_eq!(report.stopped, vec![ControllerKey::from("orders")]);
        assert!(!r.is_running("orders"));
        assert!(!r.router.contains("orders"));

        assert_eq!(store.snapshot(), vec!["start orders 1", "stop orders 1"]);
    }

    #[tokio::test]
    async fn changed_params_restart_with_a_new_instance() {
        let (mut r, store) = reconciler(vec![PageController::new("orders", "order-history")]);

        r.reconcile(&nav("order-history", 1));
        let first = r.running()[0].instance_id;

        let report = r.reconcile(&nav("order-history", 2));
        assert_eq!(report.restarted, vec![ControllerKey::from("orders")]);
        assert!(report.started.is_empty() && report.stopped.is_empty());

        let status = r.running();
        assert_ne!(status[0].instance_id, first);
        assert_eq!(status[0].params, "2");
        assert_eq!(
            store.snapshot(),
            vec!["start orders 1", "stop orders 1", "start orders 2"]
        );
    }

    #[tokio::test]
    async fn stops_run_before_starts_across_the_batch() {
        // "b" is registered first, so without phasing its start would come first.
        let (mut r, store) = reconciler(vec![
            PageController::new("b", "page-b"),
            PageController::new("a", "page-a"),
        ]);

        r.reconcile(&nav("page-a", 1));
        r.reconcile(&nav("page-b", 1));

        assert_eq!(
            store.snapshot(),
            vec!["start a 1", "stop a 1", "start b 1"]
        );
    }

    #[tokio::test]
    async fn derivation_failure_keeps_previous_state() {
        let (mut r, _store) = reconciler(vec![PageController::new("orders", "order-history")]);
        r.reconcile(&nav("order-history", 1));

        let report = r.reconcile(&nav("broken", 0));
        assert!(report.is_noop());
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::ParamDerivation { .. }]
        ));
        assert!(r.is_running("orders"));
    }

    #[tokio::test]
    async fn failed_start_discards_mutation_and_retries_next_pass() {
        let mut controller = PageController::new("orders", "order-history");
        controller.fail_start = true;
        let (mut r, store) = reconciler(vec![controller]);

        let report = r.reconcile(&nav("order-history", 1));
        assert!(report.started.is_empty());
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::LifecycleHook { hook: Hook::Start, .. }]
        ));
        assert!(!r.is_running("orders"));
        assert!(store.snapshot().is_empty());

        // Same route again: still not running, so the start is attempted again.
        let report = r.reconcile(&nav("order-history", 1));
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn failed_stop_still_removes_instance() {
        let mut controller = PageController::new("orders", "order-history");
        controller.fail_stop = true;
        let (mut r, store) = reconciler(vec![controller]);

        r.reconcile(&nav("order-history", 1));
        let report = r.reconcile(&nav("home", 0));

        assert_eq!(report.stopped, vec![ControllerKey::from("orders")]);
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::LifecycleHook { hook: Hook::Stop, .. }]
        ));
        assert!(!r.is_running("orders"));
        assert_eq!(store.snapshot(), vec!["start orders 1"]);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_controllers() {
        let mut failing = PageController::new("a", "shared");
        failing.fail_start = true;
        let (mut r, _store) = reconciler(vec![failing, PageController::new("b", "shared")]);

        let report = r.reconcile(&nav("shared", 1));
        assert_eq!(report.started, vec![ControllerKey::from("b")]);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let (mut r, store) = reconciler(vec![
            PageController::new("a", "shared"),
            PageController::new("b", "shared"),
        ]);
        r.reconcile(&nav("shared", 7));

        let (report, _lingering) = r.shutdown();
        assert_eq!(report.stopped.len(), 2);
        assert!(r.running().is_empty());
        assert!(r.router.keys().is_empty());
        assert_eq!(
            store.snapshot(),
            vec!["start a 7", "start b 7", "stop a 7", "stop b 7"]
        );
    }

    #[tokio::test]
    async fn params_are_derived_once_per_controller_per_pass() {
        let controller = PageController::new("orders", "order-history");
        let calls = Arc::clone(&controller.derive_calls);
        let (mut r, _store) = reconciler(vec![controller]);

        r.reconcile(&nav("order-history", 1));
        r.reconcile(&nav("home", 0));

        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn panicking_start_is_reported_and_the_pass_continues() {
        let mut bomb = PageController::new("a", "shared");
        bomb.panic_in = Some("start");
        let (mut r, store) = reconciler(vec![bomb, PageController::new("b", "shared")]);

        let report = r.reconcile(&nav("shared", 1));

        assert_eq!(report.started, vec![ControllerKey::from("b")]);
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::LifecycleHook { key, hook: Hook::Start, .. }] if key == "a"
        ));
        assert!(report.errors[0].to_string().contains("panicked"));
        assert!(!r.is_running("a"));
        // The panicking hook's working copy was discarded and the lock is healthy.
        assert_eq!(store.snapshot(), vec!["start b 1"]);
        store.mutate(|s| s.push("after".into()));

        // Still absent, so the next pass tries again instead of giving up.
        let report = r.reconcile(&nav("shared", 1));
        assert_eq!(report.errors.len(), 1);
        assert!(r.is_running("b"));
    }

    #[tokio::test]
    async fn panicking_stop_still_removes_instance() {
        let mut bomb = PageController::new("orders", "order-history");
        bomb.panic_in = Some("stop");
        let (mut r, store) = reconciler(vec![bomb]);

        r.reconcile(&nav("order-history", 1));
        let report = r.reconcile(&nav("home", 0));

        assert_eq!(report.stopped, vec![ControllerKey::from("orders")]);
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::LifecycleHook { hook: Hook::Stop, .. }]
        ));
        assert!(!r.is_running("orders"));
        assert!(!r.router.contains("orders"));
        assert_eq!(store.snapshot(), vec!["start orders 1"]);
    }

    #[tokio::test]
    async fn panicking_derivation_skips_only_that_controller() {
        let mut bomb = PageController::new("a", "orders");
        bomb.panic_in = Some("derive");
        let (mut r, _store) = reconciler(vec![bomb, PageController::new("b", "orders")]);

        let report = r.reconcile(&nav("orders", 3));

        assert_eq!(report.started, vec![ControllerKey::from("b")]);
        assert!(matches!(
            report.errors.as_slice(),
            [WayfinderError::ParamDerivation { key, .. }] if key == "a"
        ));
        assert!(!r.is_running("a"));
    }
}
