//! linefile: a single-client text file store
//!
//! A server owns a local directory and serves one connected client, which
//! may store a named file (`UPLOAD`) or fetch one (`RETRIEVE`) over a
//! line-oriented TCP protocol. Both sides find each other by scanning a
//! small fixed port range.
//!
//! Features:
//! - Port-range probing for bind and connect
//! - Newline-escaped payloads on a line-delimited transport
//! - Interactive terminal client
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod console;
mod events;
mod locator;
mod protocol;
mod server;
mod store;

use config::{Config, Mode};
use events::{Sink, TracingSink};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the client console
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        mode = ?config.mode,
        ports = %config.ports,
        "Starting linefile"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.mode {
        Mode::Server => runtime.block_on(run_server(config)),
        Mode::Client => runtime.block_on(run_client(config)),
    }
}

/// Serve one client, reporting every session event to the log
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        bind = %config.bind,
        directory = %config.directory.display(),
        "Using directory store"
    );
    let sink: Sink = Arc::new(TracingSink);
    server::run(&config, sink).await
}

/// Drive an interactive session from the terminal
async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(host = %config.host, newlines = ?config.content_newlines, "Using terminal console");
    console::run_client(&config).await
}
