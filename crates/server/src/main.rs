//! Voxel state-sync server.

use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Voxel Server v{}", env!("CARGO_PKG_VERSION"));

    // Optional config path as the first argument
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => server::Config::load_from(&path)?,
        None => server::Config::load()?,
    };
    info!("Loaded configuration: {}", config.server.name);
    info!("  Address: {}:{}", config.server.bind, config.server.port);
    info!("  Max connections: {}", config.server.max_connections);
    info!("  Tick interval: {}ms", config.server.tick_interval_ms);
    info!("  Ground height: {}", config.world.ground_height);

    server::run(config).await?;

    Ok(())
}
