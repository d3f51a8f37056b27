//! otrs-api — HTTP surface of the exporter.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `metrics_path` (default `/metrics`) | Prometheus exposition |
//! | GET | `/healthz` | Liveness, always `ok` while the server runs |
//!
//! Scrapes never trigger collection; they render whatever the registry
//! holds at that instant.

pub mod handlers;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::SystemTime;

use axum::Router;
use axum::routing::get;
use otrs_core::config::HEALTH_PATH;
use otrs_metrics::{Registry, RenderOptions};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub render: RenderOptions,
    /// Process start, exported as `exporter_start_time_seconds`.
    pub start_time: SystemTime,
    /// Samples dropped or scrapes failed during rendering.
    pub render_errors: Arc<AtomicU64>,
}

impl ApiState {
    pub fn new(registry: Arc<Registry>, render: RenderOptions) -> Self {
        Self {
            registry,
            render,
            start_time: SystemTime::now(),
            render_errors: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Build the router with the scrape endpoint mounted at `metrics_path`.
pub fn build_router(state: ApiState, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(handlers::prometheus_metrics))
        .route(HEALTH_PATH, get(handlers::healthz))
        .with_state(state)
}
