//! # Order History Demo
//!
//! A simulated router walks `home -> order-history -> order-history?page=2 -> home`.
//! The orders controller starts when its page is entered, fetches over HTTP
//! with `reqwest` whenever it is told to refresh, and clears its slice of the
//! state tree when the user navigates away.
//!
//! ```text
//! RUST_LOG=wayfinder_core=debug cargo run -p order-history-demo
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wayfinder_core::{Controller, ControllerContext, ControllerKey, EngineBuilder, EngineConfig};

// ============================================================================
// Routes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct AppRoute {
    page: &'static str,
    query: Option<u32>,
}

impl AppRoute {
    fn new(page: &'static str) -> Self {
        Self { page, query: None }
    }

    fn with_page_number(mut self, n: u32) -> Self {
        self.query = Some(n);
        self
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Default)]
struct AppState {
    orders: OrdersState,
}

#[derive(Debug, Clone, Default)]
struct OrdersState {
    page: u32,
    loading: bool,
    items: Vec<Order>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Order {
    id: u64,
    title: String,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone)]
enum AppCommand {
    /// Re-fetch the current page of orders
    Refresh,
}

// ============================================================================
// Controller
// ============================================================================

struct OrdersController {
    http_client: reqwest::Client,
    base_url: String,
}

impl OrdersController {
    async fn fetch(&self, page: u32) -> Result<Vec<Order>> {
        let orders = self
            .http_client
            .get(format!("{}/posts", self.base_url))
            .query(&[("_page", page), ("_limit", 5)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(orders)
    }
}

#[async_trait]
impl Controller<AppRoute, AppState, AppCommand> for OrdersController {
    type Params = u32;

    fn key(&self) -> ControllerKey {
        "orders".into()
    }

    fn derive_params(&self, route: &AppRoute) -> Result<Option<u32>> {
        Ok((route.page == "order-history").then(|| route.query.unwrap_or(1)))
    }

    fn start(&self, page: &u32, state: &mut AppState) -> Result<()> {
        state.orders = OrdersState {
            page: *page,
            loading: true,
            ..Default::default()
        };
        Ok(())
    }

    fn stop(&self, _: &u32, state: &mut AppState) -> Result<()> {
        state.orders = OrdersState::default();
        Ok(())
    }

    async fn on_command(
        &self,
        page: &u32,
        command: AppCommand,
        ctx: &ControllerContext<AppState, AppCommand>,
    ) -> Result<()> {
        let AppCommand::Refresh = command;

        let result = self.fetch(*page).await;
        ctx.store().mutate(|s| {
            s.orders.loading = false;
            match result {
                Ok(items) => {
                    info!(page, count = items.len(), "orders loaded");
                    s.orders.items = items;
                    s.orders.error = None;
                }
                Err(err) => s.orders.error = Some(err.to_string()),
            }
        })?;
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::default();
    if let Ok(capacity) = std::env::var("WAYFINDER_INBOX_CAPACITY") {
        config = config.with_inbox_capacity(capacity.parse()?);
    }

    let orders = OrdersController {
        http_client: reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?,
        base_url: "https://jsonplaceholder.typicode.com".to_string(),
    };

    let handle = EngineBuilder::<AppRoute, AppState, AppCommand>::new(AppState::default())
        .with_config(config)
        .with_controller(orders)
        .build()?
        .start();

    let store = handle.store();
    let walk = [
        AppRoute::new("home"),
        AppRoute::new("order-history"),
        AppRoute::new("order-history").with_page_number(2),
        AppRoute::new("home"),
    ];

    for route in walk {
        println!("Navigating to {route:?}");
        let applied = handle.navigate_and_await(route).await?;
        println!(
            "  started={:?} stopped={:?} restarted={:?}",
            applied.started, applied.stopped, applied.restarted
        );

        if handle.is_running("orders") {
            handle.send("orders", AppCommand::Refresh).await?;
            let mut changes = store.changes();
            tokio::time::timeout(
                Duration::from_secs(15),
                changes.wait_for(|_| !store.read(|s| s.orders.loading)),
            )
            .await??;
        }

        store.read(|s| {
            let orders = &s.orders;
            if let Some(error) = &orders.error {
                println!("  orders page {} failed: {error}", orders.page);
            }
            for order in &orders.items {
                println!("  #{} {}", order.id, order.title);
            }
        });
    }

    let report = handle.shutdown().await;
    println!("Shut down, stopped {:?}", report.stopped);

    Ok(())
}
