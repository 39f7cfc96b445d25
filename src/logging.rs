use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber for this process.
///
/// RUST_LOG takes precedence; otherwise the configured level is applied to
/// the crate's own targets.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shardmesh={}", config.level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Initialize logging with fallback behavior if setup fails.
pub fn init_logging_safe(config: &LoggingConfig) {
    if let Err(e) = init_logging(config) {
        eprintln!("Warning: failed to set up logging: {}", e);
    }
}
