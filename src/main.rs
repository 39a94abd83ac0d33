//! chat-broadcast: a multi-client TCP line broadcaster
//!
//! Every line a client sends is rebroadcast to all other connected
//! clients, and joins and leaves are announced to everyone.
//!
//! Features:
//! - Readiness-based accept loop (mio) with one thread per session
//! - Optional tokio runtime with one task pair per session
//! - Bounded session registry with per-recipient failure isolation
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;
mod server;

use config::{Config, RuntimeType};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        max_sessions = config.max_sessions,
        runtime = ?config.runtime,
        "Starting chat-broadcast server"
    );

    let listen = config.listen;
    let result = match config.runtime {
        RuntimeType::Mio => run_mio(config),
        RuntimeType::Tokio => run_tokio(config),
    };

    result.map_err(|e| format!("server on {listen} failed: {e}").into())
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> std::io::Result<()> {
    info!("Using mio runtime (one thread per session)");
    runtime::run_mio(config)
}

/// Run with tokio runtime
fn run_tokio(config: Config) -> std::io::Result<()> {
    info!("Using tokio runtime (one task pair per session)");
    runtime::run_tokio(config)
}
