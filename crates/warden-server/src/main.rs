use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use warden_core::models::CoreError;
use warden_server::config::{CONFIG_PATH_ENV, config_path};
use warden_server::{AppState, ConfigError, ServerConfig, router};

#[derive(Debug, Error)]
pub enum WardenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), WardenError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let path = config_path(std::env::args().skip(1), std::env::var(CONFIG_PATH_ENV).ok());
    let config = ServerConfig::load(path.as_deref())?;

    let state = AppState::build(&config)?;
    let background = state.start_background();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        public_url = %config.public_url,
        persistent = config.database_path.is_some(),
        "warden listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    tracing::info!("warden stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
