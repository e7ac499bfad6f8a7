//! # Wayfinder
//!
//! A route-driven reconciliation engine: given the application's current
//! route, it decides which long-running controllers should be running,
//! starts, stops and restarts them, and routes commands to them.
//!
//! ## Core Concepts
//!
//! - [`Route`] = where the application is (opaque, produced by your router)
//! - [`Params`] = what a controller needs from that route, or nothing
//! - [`Controller`] = lifecycle hooks plus a background command loop
//! - [`Store`] = the single shared state tree every controller works on
//!
//! The key principle: **same route, same running set**. A full reload and an
//! in-app navigation go through the identical diff, so what runs never
//! depends on how you got here.
//!
//! ## Architecture
//!
//! ```text
//! Router collaborator
//!     │
//!     ▼ navigate(route)
//! Route driver (latest route wins) ───────────────────────┐
//!     │                                                   │
//!     ▼ reconcile(route)                                  │
//! Reconciler                                              │
//!     │                                                   │
//!     ├─► orders.derive_params()  ─► Some(p) ─► Start     │
//!     ├─► profile.derive_params() ─► None    ─► Stop      │
//!     └─► search.derive_params()  ─► Some(q) ─► Restart   │
//!                                                         │
//!     phase 1: every stop()      (store.try_mutate)       │
//!     phase 2: every start()     (store.try_mutate)       │
//!              └─► spawn handle(params, ctx, inbox)       │
//!                                                         │
//! I/O callbacks ─► CommandRouter.send(key, cmd) ─► inbox ─┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Structural equality** - Equal params mean no lifecycle action
//! 2. **Stop before start** - Within one pass, every stop precedes every start
//! 3. **Serialized passes** - Reconciliations never overlap; bursts coalesce to the latest route
//! 4. **Per-key FIFO** - Commands to one controller arrive in submission order
//! 5. **Local failure** - One controller's error never aborts the rest of the pass
//! 6. **Cooperative stop** - Stopped processes are signalled, never killed
//!
//! ## Guarantees
//!
//! - **No zombies**: A stopped instance leaves the running set even if its `stop` hook fails
//! - **Discarded failures**: A failing hook's state mutation is never committed
//! - **Late callbacks are safe**: Commands for a stopped controller are absorbed by `dispatch`
//!
//! Not provided: cross-controller isolation in the store (last write wins),
//! multi-step transactions, persistence.
//!
//! ## Example
//!
//! ```ignore
//! use wayfinder_core::{async_trait, Controller, ControllerContext, ControllerKey, EngineBuilder};
//!
//! #[derive(Clone)]
//! struct AppRoute { page: String }
//!
//! #[derive(Clone, Default)]
//! struct AppState { orders: Vec<String>, loading: bool }
//!
//! #[derive(Debug, Clone)]
//! enum AppCommand { Loaded(Vec<String>) }
//!
//! struct OrdersController;
//!
//! #[async_trait]
//! impl Controller<AppRoute, AppState, AppCommand> for OrdersController {
//!     type Params = bool;
//!
//!     fn key(&self) -> ControllerKey {
//!         "orders".into()
//!     }
//!
//!     fn derive_params(&self, route: &AppRoute) -> anyhow::Result<Option<bool>> {
//!         Ok((route.page == "order-history").then_some(true))
//!     }
//!
//!     fn start(&self, _: &bool, state: &mut AppState) -> anyhow::Result<()> {
//!         state.loading = true;
//!         Ok(())
//!     }
//!
//!     fn stop(&self, _: &bool, state: &mut AppState) -> anyhow::Result<()> {
//!         state.orders.clear();
//!         state.loading = false;
//!         Ok(())
//!     }
//!
//!     async fn on_command(
//!         &self,
//!         _: &bool,
//!         command: AppCommand,
//!         ctx: &ControllerContext<AppState, AppCommand>,
//!     ) -> anyhow::Result<()> {
//!         let AppCommand::Loaded(orders) = command;
//!         ctx.store().mutate(|s| {
//!             s.orders = orders;
//!             s.loading = false;
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! let handle = EngineBuilder::new(AppState::default())
//!     .with_controller(OrdersController)
//!     .build()?
//!     .start();
//!
//! handle.navigate_and_await(AppRoute { page: "order-history".into() }).await?;
//! handle.dispatch("orders", AppCommand::Loaded(vec!["#1001".into()])).await;
//! ```
//!
//! ## What This Is Not
//!
//! Wayfinder is **not**:
//! - A router (it never looks inside a route)
//! - A renderer (the view layer only reads the store)
//! - A pipeline or saga engine
//! - A supervisor that restarts crashed processes
//!
//! Wayfinder **is**:
//! > A reconciliation engine that keeps the running controllers in line with
//! > the current route, and gives each one a private command channel.

// Core modules
mod config;
mod context;
mod controller;
mod diff;
mod engine;
mod error;
mod instance;
mod reconciler;
mod router;
mod store;
mod types;


// Re-export core traits
pub use crate::types::{Command, ControllerKey, Params, Route, State};

// Re-export error types
pub use crate::error::{Hook, Result, WayfinderError};

// Re-export controller types
pub use controller::Controller;
pub use context::{ControllerContext, Emitted, Inbox, Outbox, ScopedStore};
pub use instance::ControllerStatus;

// Re-export store types
pub use store::{Store, StoreReader};

// Re-export reconciliation types
pub use diff::{diff, Transition};
pub use reconciler::ReconcileReport;

// Re-export routing types
pub use router::CommandRouter;

// Re-export config types
pub use config::{
    EngineConfig, DEFAULT_EMITTED_CAPACITY, DEFAULT_INBOX_CAPACITY, DEFAULT_SHUTDOWN_GRACE_MS,
};

// Re-export engine types (primary entry point)
pub use engine::{AppliedRoute, Engine, EngineBuilder, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
