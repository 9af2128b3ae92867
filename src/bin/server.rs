use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use rusty_chat::config::ServerConfig;
use rusty_chat::core::Hub;
use rusty_chat::handlers::{routes, start_stats_logging};

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from env
    let config = match ServerConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, max_connections={}, rate_limit={}/{:?}",
        config.host,
        config.port,
        config.max_connections,
        config.rate_limit_messages,
        config.rate_limit_window
    );

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let (hub, hub_task) = Hub::spawn(&config);
    let stats_task = start_stats_logging(hub.clone(), config.stats_interval);

    let shutdown_hub = hub.clone();
    let (bound, server) = match warp::serve(routes(hub, config.clone()))
        .try_bind_with_graceful_shutdown(addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }) {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Starting Rusty Chat server on {}", bound);
    server.await;

    shutdown_hub.shutdown();
    stats_task.abort();
    if let Err(e) = hub_task.await {
        error!("Hub task ended abnormally: {}", e);
    }
    info!("Server stopped");
}
