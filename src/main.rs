//! fanout: a single-threaded TCP broadcast relay
//!
//! Every client connects to one listening socket. Each chunk of bytes read
//! from a client is written verbatim to every other connected client.
//!
//! Features:
//! - One readiness-driven event loop, no per-connection threads
//! - Bounded client capacity; extra clients are closed on accept
//! - Failed or disconnected clients are dropped without affecting others
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use runtime::EventLoop;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        max_connections = config.max_connections,
        chunk_size = config.chunk_size,
        "Starting fanout relay"
    );

    let mut event_loop = match EventLoop::bind(&config) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(error = %e, "Relay failed to start");
            std::process::exit(1);
        }
    };

    event_loop.run()
}
