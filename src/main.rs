//! # Chat Relay
//!
//! Application entry point that initializes:
//! - Tracing/logging subsystem
//! - Configuration loading
//! - Presence cache and, in bus mode, the message bus
//! - HTTP/WebSocket server with signal-driven shutdown

use anyhow::Result;
use tracing::info;

use chat_relay::config::Settings;
use chat_relay::presentation::http::handlers::health;
use chat_relay::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    chat_relay::telemetry::init_tracing();
    health::init_server_start();

    info!("Starting Chat Relay...");

    // Load configuration from environment and config files
    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        mode = %settings.messaging.mode,
        environment = %settings.environment,
        "Configuration loaded"
    );

    // Build and run the application
    let application = Application::build(settings).await?;

    info!("Server ready to accept connections");
    application.run_until_stopped().await?;

    info!("Chat Relay stopped");
    Ok(())
}
