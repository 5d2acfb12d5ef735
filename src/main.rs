use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use passdesk::config::Configuration;
use passdesk::{app, initialize_state, telemetry};

const DEFAULT_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_default();
    let config = Configuration::default().path(path).read();

    let providers = telemetry::init(
        config.as_ref().ok().and_then(|config| config.telemetry.as_ref()),
    )?;

    let config = config.unwrap_or_else(|err| {
        tracing::error!(%err, "cannot read configuration, using an empty one");
        Configuration::fallback()
    });

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(%err, "prometheus recorder not installed");
            None
        },
    };

    let state = initialize_state(config, metrics);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, version = state.config.version(), "server listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    providers.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received ctrl-c, shutting down"),
        Err(err) => {
            tracing::error!(%err, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        },
    }
}
