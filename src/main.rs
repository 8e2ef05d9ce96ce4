//! chunk-listener: a single-connection TCP listener
//!
//! Binds a port (default 0.0.0.0:5001), accepts one connection at a time
//! and prints every chunk it receives, decoded as UTF-8, to stdout. When
//! the peer closes the connection the listener goes back to accepting.
//!
//! Features:
//! - Strictly sequential service; later peers wait in the kernel backlog
//! - Multi-byte characters split across reads are reassembled
//! - Strict or lossy handling of invalid UTF-8
//! - Optional idle read timeout
//! - Configuration via CLI arguments or TOML file

mod config;
mod decoder;
mod error;
mod listener;

use config::Config;
use error::ListenerError;
use listener::Listener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for received text
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        read_timeout = ?config.read_timeout,
        decode = ?config.decode,
        "Starting chunk-listener"
    );

    // One thread, one connection at a time
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))?;
    Ok(())
}

async fn serve(config: Config) -> Result<(), ListenerError> {
    let listener = Listener::bind(&config).await?;
    match listener.run(tokio::io::stdout()).await? {}
}
