//! pgwire-double: PostgreSQL wire protocol test server
//!
//! Answers every simple query with a fixed completion tag, which is enough
//! for drivers and applications to connect and exercise their query path.
//!
//! Features:
//! - Startup handshake with configurable server_version and TimeZone
//! - Simple query protocol
//! - Configuration via CLI arguments or TOML file

use pgwire_double::config::Config;
use pgwire_double::handler::FixedReply;
use pgwire_double::server::{Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        server_version = %config.server_version,
        time_zone = %config.time_zone,
        reply = config.reply.as_deref().unwrap_or("OK"),
        "Starting pgwire-double server"
    );

    let server = Server::new(
        ServerConfig::new(config.port, FixedReply::new(config.reply.clone())),
        config.server_options(),
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
