//! camserve: live camera frames over HTTP and WebSocket

use camserve::server::Server;
use camserve::{start_capture, Config};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camserve=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camserve launching...");

    // Load configuration
    let config = Config::load()?;
    info!("Using capture device: {}", config.capture.device);

    // No device, no service: initialization errors end the process here.
    let (feed, capture) = start_capture(&config.capture)?;

    let server = Server::bind(&config.server.listen, feed, config.server.page).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    tokio::task::spawn_blocking(move || capture.stop()).await?;

    info!("camserve shutting down");
    Ok(())
}
