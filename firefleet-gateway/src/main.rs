//! Entry point for the `firefleet-gateway` HTTP server.

use std::sync::Arc;

use firefleet_engine::{EngineConfig, VmOrchestrator};
use firefleet_gateway::routes::create_router;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("FIREFLEET_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3456".to_owned());

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let engine = match VmOrchestrator::from_config(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!(error = %e, "failed to open engine");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.health_check().await {
        tracing::warn!(error = %e, "host is not ready to launch microVMs");
    }

    match engine.reconcile().await {
        Ok(report) => info!(
            adopted = report.adopted.len(),
            failed = report.failed.len(),
            rolled_back = report.rolled_back.len(),
            stale_sockets = report.stale_sockets_removed,
            stale_workspaces = report.stale_workspaces_removed,
            "startup reconciliation finished"
        ),
        Err(e) => {
            tracing::error!(error = %e, "startup reconciliation failed");
            std::process::exit(1);
        }
    }

    let sweeper = engine.spawn_sweeper();
    let app = create_router(Arc::clone(&engine));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "firefleet-gateway listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for shutdown signal");
        }
        info!("shutting down");
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }

    if let Some(task) = sweeper {
        task.abort();
    }
}
