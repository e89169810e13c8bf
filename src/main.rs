//! PDF/A Conversion Service
//!
//! HTTP front-end for an external PDF/A conversion tool. Each request borrows
//! a converter from a bounded pool, converts one file, and streams the result
//! back; staged inputs and outputs are deleted once the response is sent.
//!
//! ## Architecture
//!
//! - **HTTP**: axum (`GET/POST /convert`, `GET /version`, `GET /health`)
//! - **Pool**: bounded converter pool with warm-up and a maintenance task
//! - **Converter**: external command-line tool (`PDFA_TOOL`)
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (optionally loaded from the file named by
//! `PDFA_SERVICE_PROPS`, or `.env`):
//! - `PDFA_BIND_ADDR`: listen address (default: 0.0.0.0:8080)
//! - `PDFA_MAX_POOL_SIZE` / `PDFA_MIN_IDLE`: pool bounds (default: 10 / 3)
//! - `PDFA_TOOL`: conversion program (default: pdfa-convert)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint (telemetry is off when unset)
//! - `RUST_LOG`: Log filter (default: pdfa_service=info,pool=info,tower_http=info)
//! - `LOG_FORMAT`: `json` for JSON log lines

use anyhow::{Context, Result};
use pdfa_service::{
    config::{self, ServiceConfig},
    converter::CommandConverterFactory,
    pool::ConverterPool,
    routes::{self, AppState},
    telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Properties first, so RUST_LOG and LOG_FORMAT may come from the file
    let props = config::load_properties().context("Failed to load service properties")?;

    init_tracing();

    if let Some(path) = props {
        info!("Loaded properties from {}", path.display());
    }

    let config = ServiceConfig::from_env().context("Invalid service configuration")?;

    if let Some(ref endpoint) = config.otlp_endpoint {
        if let Err(e) = telemetry::init_telemetry(endpoint) {
            warn!("Failed to initialize telemetry: {}", e);
        }
    }

    info!("Starting PDF/A conversion service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration: bind_addr={}, max_pool_size={}, min_idle={}, borrow_timeout={:?}, tool={}",
        config.bind_addr, config.max_pool_size, config.min_idle, config.borrow_timeout, config.tool_program
    );
    info!(
        "Directories: staging={}, output={}",
        config.staging_dir.display(),
        config.output_dir.display()
    );

    let factory = Arc::new(CommandConverterFactory::new(config.tool_command()));
    let pool = ConverterPool::new(factory, config.pool_config());

    let warmed = pool.warm_up().await;
    if warmed < config.min_idle {
        warn!(
            "Only {} of {} converter(s) could be created at startup",
            warmed, config.min_idle
        );
    }

    let state = AppState::new(&config, pool.clone())
        .context("Failed to prepare staging and output directories")?;

    let maintenance = tokio::spawn(maintenance_loop(pool.clone(), config.maintenance_interval));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("PDF/A conversion service listening on {}", config.bind_addr);

    axum::serve(listener, routes::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, releasing converters...");
    maintenance.abort();
    pool.close();
    state.staging().purge();
    telemetry::shutdown_telemetry();

    info!("Service shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pdfa_service=info,pool=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Keeps `min_idle` converters warm and emits the pool heartbeat.
async fn maintenance_loop(pool: ConverterPool, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; startup already warmed the pool.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let created = pool.ensure_min_idle().await;
        if created > 0 {
            info!(target: "pool", "Maintenance created {} converter(s)", created);
        }
        telemetry::record_pool_heartbeat(&pool.stats());
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
