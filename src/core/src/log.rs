//! Logging initialization.
//!
//! Thin wrapper over `tracing-subscriber` so the CLI and tests share one
//! setup path. The filter defaults to `shale=info` and can be overridden
//! with `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr so JSON reports on stdout stay machine-readable.
/// Safe to call once per process; later calls are ignored.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose { "shale=debug" } else { "shale=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
