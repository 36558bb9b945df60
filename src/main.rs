//! ws-fanout: a WebSocket echo/fan-out benchmark server
//!
//! Accepts JSON messages of the form
//! `{"client_id": ..., "msg_id": ..., "msg": ..., "created_at": <ms>}`
//! and answers each with an augmented copy carrying the server clock and
//! the measured one-way latency, sent `write_factor` times.
//!
//! Features:
//! - Configurable bind address, write factor, and backpressure ceiling
//! - Configuration via CLI arguments or TOML file
//! - Structured logging with env-filter overrides

use tracing::info;
use tracing_subscriber::EnvFilter;
use ws_fanout::config::Config;
use ws_fanout::server::Server;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
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
        listen = %config.listen,
        write_factor = config.write_factor,
        max_backpressure = config.max_backpressure,
        "Starting ws-fanout server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async { Server::new(config).run().await })?;
    Ok(())
}
