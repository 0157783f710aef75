use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod delivery;
pub mod dkim;
pub mod mail;
pub mod mime_builder;
pub mod mx;
pub mod proxy;
pub mod registry;
pub mod smtp_client;

use crate::{api::ApiServer, config::Config, delivery::DeliveryEngine, registry::Registry};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=trace,tower_http=debug,axum=trace,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let registry = Arc::new(load_registry(&config)?);
    let engine = DeliveryEngine::new(config.clone(), registry.clone());

    if let Some(path) = config.http.runtime_file_path.clone() {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(registry::run_snapshotter(registry, path, shutdown));
    }

    let socket = format!("{}:{}", config.http.listen_host, config.http.listen_port)
        .parse()
        .expect("HTTP_LISTEN_HOST/HTTP_LISTEN_PORT must form a valid socket address");

    let server = ApiServer::new(socket, config, registry, engine, shutdown.clone());
    server.spawn();

    shutdown_signal(shutdown.clone()).await;
    tracing::info!("received shutdown signal, stopping restmailer");
    shutdown.cancel();

    // Give the snapshotter's final flush a moment to land before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}

fn load_registry(config: &Config) -> anyhow::Result<Registry> {
    match &config.http.runtime_file_path {
        Some(path) => Ok(Registry::from_snapshot(registry::load_snapshot(path)?)),
        None => Ok(Registry::new()),
    }
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
