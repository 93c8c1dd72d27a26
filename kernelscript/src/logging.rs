use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Initialize tracing once: stderr always, plus an optional log file.
/// Filtering follows RUST_LOG; diagnostics for the user go to stderr
/// through the driver, not through tracing.
pub fn initialize_logging(log_file_path: Option<&str>) -> Result<()> {
    if INIT_GUARD.set(()).is_err() {
        // Already initialized elsewhere; do nothing and succeed
        return Ok(());
    }

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());

    match log_file_path {
        Some(path) => {
            let log_path = PathBuf::from(path);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&log_path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
                .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());
            let _ = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
        }
    }

    Ok(())
}
