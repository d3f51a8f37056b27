//! otrs-exporterd — Prometheus exporter for an OTRS installation.
//!
//! Single binary that assembles:
//! - Configuration (TOML file + `OTRS_EXP_*` environment)
//! - Collectors: service health, mail log tail, ticket statistics
//! - Scheduler feeding the latest-value registry
//! - HTTP server for `/metrics` and `/healthz`
//!
//! # Usage
//!
//! ```text
//! otrs-exporterd --config /etc/otrs-exporter.toml
//! OTRS_EXP_PORT=9100 OTRS_EXP_DB_PW=secret otrs-exporterd --log-format json
//! ```

mod service_state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use otrs_api::{ApiState, build_router};
use otrs_collectors::configured_collectors;
use otrs_core::ExporterConfig;
use otrs_metrics::{Registry, RenderOptions};
use otrs_scheduler::Scheduler;

use crate::service_state::{Lifecycle, notify_service_manager, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "otrs-exporterd", about = "Prometheus exporter for OTRS", version)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply without one.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load before logging is up so the config's debug flag can apply; the
    // error itself is reported once the subscriber exists.
    let config = ExporterConfig::load(cli.config.as_deref());
    let debug = cli.debug || config.as_ref().is_ok_and(|c| c.debug);
    init_tracing(cli.log_format, debug);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e.into());
        }
    };

    run(config).await
}

fn init_tracing(format: LogFormat, debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: ExporterConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "OTRS exporter starting");

    // ── Collectors and registry ────────────────────────────────

    let registry = Arc::new(Registry::new(config.stale_after));
    let collectors = configured_collectors(&config)?;

    // ── Bind before anything runs ──────────────────────────────

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;
    info!(
        addr = %config.listen_address,
        path = %config.metrics_path,
        "metrics endpoint listening"
    );

    // ── Start collector loops ──────────────────────────────────

    let mut scheduler = Scheduler::new(Arc::clone(&registry), config.degraded_threshold);
    for scheduled in collectors {
        scheduler.schedule(scheduled.collector, scheduled.interval)?;
    }

    // ── Serve until signalled ──────────────────────────────────

    let state = ApiState::new(
        registry,
        RenderOptions {
            timestamps: config.render_timestamps,
        },
    );
    let router = build_router(state, &config.metrics_path);

    notify_service_manager(Lifecycle::Ready);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            wait_for_shutdown().await;
            notify_service_manager(Lifecycle::Stopping);
        })
        .await
        .context("metrics server failed")?;

    if let Err(e) = scheduler.stop(config.shutdown_grace).await {
        warn!(error = %e, "collectors did not stop cleanly");
    }

    info!("OTRS exporter stopped");
    Ok(())
}
