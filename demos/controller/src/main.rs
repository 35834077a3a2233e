//! Agent fleet controller.
//!
//! Run with: cargo run -p fleet-controller
//!
//! Agents connect to `ws://<listen_addr>/agent/connect`. Configuration is read
//! from the JSON file named by `FLEET_CONFIG`, defaults otherwise.

mod api;
mod app;
mod inventory;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{Controller, ControllerFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::var("FLEET_CONFIG").ok();
    let file = ControllerFile::load(config_path.as_deref())?;
    let listen_addr = file.controller.listen_addr;
    let controller = Controller::new(file)?;

    let (stop, _) = broadcast::channel(1);
    let mut tasks = controller.spawn(&stop);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(%listen_addr, replica_id = %controller.forwarding.replica_id(), "Controller listening");

    // Sessions hold their upgraded connections open, so they are drained
    // before the server waits for connections to finish.
    let draining = std::sync::Arc::clone(&controller);
    axum::serve(listener, controller.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown().await;
        })
        .await
        .context("serving")?;

    let _ = stop.send(());
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "Background task failed");
        }
    }
    tracing::info!("Controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
