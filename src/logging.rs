use std::path::Path;

use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process-level logging: an ANSI console layer plus a daily-rolling file
/// under `<storage>/logs/`. Container log streams are handled separately by
/// the per-container log sinks.
pub fn init_logging(log_dir: &Path) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, "vertex.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let (non_blocking_stdout, guard2) = non_blocking(std::io::stdout());

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let console_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    // Keep the writer guards alive for the entire program duration
    std::mem::forget(guard);
    std::mem::forget(guard2);

    Ok(())
}
