//! The controller interface and its type-erased form.

use crate::context::{ControllerContext, Inbox};
use crate::types::{AnyParams, Command, ControllerKey, Params, Route, State};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn, Instrument};

/// A route-scoped, long-running stateful worker.
///
/// The engine calls [`derive_params`](Self::derive_params) on every route
/// change and starts, stops or restarts the controller depending on how the
/// result compares with the params it is currently running with.
///
/// `start` and `stop` run synchronously inside a reconciliation pass and
/// receive the state tree by `&mut`. Their mutation is committed only if they
/// return `Ok`. `handle` is the background process, spawned after a
/// successful `start`.
///
/// # Example
///
/// ```ignore
/// struct OrdersController;
///
/// #[async_trait]
/// impl Controller<AppRoute, AppState, AppCommand> for OrdersController {
///     type Params = OrderFilter;
///
///     fn key(&self) -> ControllerKey {
///         "orders".into()
///     }
///
///     fn derive_params(&self, route: &AppRoute) -> anyhow::Result<Option<OrderFilter>> {
///         Ok((route.page == "order-history").then(|| OrderFilter::from(route)))
///     }
///
///     fn start(&self, _: &OrderFilter, state: &mut AppState) -> anyhow::Result<()> {
///         state.orders.loading = true;
///         Ok(())
///     }
///
///     fn stop(&self, _: &OrderFilter, state: &mut AppState) -> anyhow::Result<()> {
///         state.orders = Default::default();
///         Ok(())
///     }
///
///     async fn on_command(
///         &self,
///         _: &OrderFilter,
///         command: AppCommand,
///         ctx: &ControllerContext<AppState, AppCommand>,
///     ) -> anyhow::Result<()> {
///         if let AppCommand::OrdersLoaded(orders) = command {
///             ctx.store().mutate(|s| s.orders.items = orders)?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Controller<R, S, C>: Send + Sync + 'static
where
    R: Route,
    S: State,
    C: Command,
{
    type Params: Params;

    /// Unique and stable for the lifetime of the process.
    fn key(&self) -> ControllerKey;

    /// `Ok(None)` means the controller does not apply to this route.
    fn derive_params(&self, route: &R) -> anyhow::Result<Option<Self::Params>>;

    fn start(&self, _params: &Self::Params, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }

    /// Clean up whatever state this controller owns.
    fn stop(&self, _params: &Self::Params, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }

    /// React to one command. Used by the default [`handle`](Self::handle) loop.
    async fn on_command(
        &self,
        _params: &Self::Params,
        _command: C,
        _ctx: &ControllerContext<S, C>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The background process.
    ///
    /// The default reads one command at a time and hands it to
    /// [`on_command`](Self::on_command) until the inbox reports that this
    /// instance was stopped. A failing command is logged and the loop goes on.
    async fn handle(
        &self,
        params: Self::Params,
        ctx: ControllerContext<S, C>,
        mut inbox: Inbox<C>,
    ) -> anyhow::Result<()> {
        while let Some(command) = inbox.recv().await {
            if let Err(err) = self.on_command(&params, command, &ctx).await {
                warn!(error = %err, "command failed");
            }
        }
        Ok(())
    }
}

/// Object-safe view of a [`Controller`] with its params erased.
///
/// The reconciler only ever talks to controllers through this.
pub(crate) trait DynController<R, S, C>: Send + Sync {
    fn key(&self) -> ControllerKey;

    fn derive_params(&self, route: &R) -> anyhow::Result<Option<Box<dyn AnyParams>>>;

    fn start(&self, params: &dyn AnyParams, state: &mut S) -> anyhow::Result<()>;

    fn stop(&self, params: &dyn AnyParams, state: &mut S) -> anyhow::Result<()>;

    /// Spawn the background process for `params`.
    fn spawn(
        &self,
        params: &dyn AnyParams,
        ctx: ControllerContext<S, C>,
        inbox: Inbox<C>,
    ) -> tokio::task::JoinHandle<()>;
}

pub(crate) struct Erased<T> {
    inner: Arc<T>,
}

impl<T> Erased<T> {
    pub(crate) fn new(controller: T) -> Self {
        Self {
            inner: Arc::new(controller),
        }
    }

    fn downcast<'a, P: Params>(
        key: &ControllerKey,
        params: &'a dyn AnyParams,
    ) -> anyhow::Result<&'a P> {
        params.as_any().downcast_ref::<P>().ok_or_else(|| {
            anyhow::anyhow!("controller '{key}' handed params of the wrong type: {params:?}")
        })
    }
}

impl<R, S, C, T> DynController<R, S, C> for Erased<T>
where
    R: Route,
    S: State,
    C: Command,
    T: Controller<R, S, C>,
{
    fn key(&self) -> ControllerKey {
        self.inner.key()
    }

    fn derive_params(&self, route: &R) -> anyhow::Result<Option<Box<dyn AnyParams>>> {
        Ok(self
            .inner
            .derive_params(route)?
            .map(|params| Box::new(params) as Box<dyn AnyParams>))
    }

    fn start(&self, params: &dyn AnyParams, state: &mut S) -> anyhow::Result<()> {
        let params = Self::downcast::<T::Params>(&self.inner.key(), params)?;
        self.inner.start(params, state)
    }

    fn stop(&self, params: &dyn AnyParams, state: &mut S) -> anyhow::Result<()> {
        let params = Self::downcast::<T::Params>(&self.inner.key(), params)?;
        self.inner.stop(params, state)
    }

    fn spawn(
        &self,
        params: &dyn AnyParams,
        ctx: ControllerContext<S, C>,
        inbox: Inbox<C>,
    ) -> tokio::task::JoinHandle<()> {
        let key = ctx.key().clone();
        let instance_id = ctx.instance_id();
        let controller = Arc::clone(&self.inner);
        // The params were produced by this controller's own derive_params.
        let params = Self::downcast::<T::Params>(&key, params).cloned();

        let span = tracing::info_span!("controller", key = %key, instance_id = %instance_id);
        tokio::spawn(
            async move {
                let params = match params {
                    Ok(params) => params,
                    Err(err) => {
                        error!(error = %err, "background process not started");
                        return;
                    }
                };

                let run = AssertUnwindSafe(controller.handle(params, ctx, inbox)).catch_unwind();
                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(error = %err, "background process failed"),
                    Err(_) => error!("background process panicked"),
                }
            }
            .instrument(span),
        )
    }
}
