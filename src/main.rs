//! framed-server: a length-prefixed framed TCP server
//!
//! Every message is a 4-byte big-endian length followed by the payload.
//! Each connection is served by its own task, strictly request/response.
//!
//! Features:
//! - Built-in echo and ping services
//! - Idle, read and write deadlines per session
//! - Graceful drain on Ctrl-C / SIGTERM with a bounded timeout
//! - Configuration via CLI arguments or TOML file

use framed_server::config::Config;
use framed_server::lifecycle::{shutdown_signal, DrainOutcome, Lifecycle};
use framed_server::services::Builtin;
use tracing::{info, warn};
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
        service = ?config.service,
        max_frame_size = config.max_frame_size,
        max_connections = config.max_connections,
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        shutdown_timeout_ms = config.shutdown_timeout.as_millis() as u64,
        "Starting framed-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("framed-worker");
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let service = Builtin::from(config.service);
    let report = runtime.block_on(Lifecycle::new(config, service).run_until(shutdown_signal()))?;

    match report.outcome {
        DrainOutcome::Clean => info!("All sessions drained"),
        DrainOutcome::TimedOut { remaining, forced } => {
            warn!(remaining, forced, "Shutdown timed out before all sessions drained")
        }
    }

    Ok(())
}
