//! Tracing setup for applications embedding the engine.
//!
//! The engine only emits `tracing` events. Compile summaries are logged at
//! INFO, pass and builder activity at DEBUG, and internal errors at ERROR
//! with their full detail before they are redacted for callers.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

/// Installs a subscriber writing to `qtl.log` in `log_dir`, rotated daily.
///
/// `RUST_LOG` controls the filter and defaults to `info`. The returned guard
/// flushes buffered lines when dropped and must be kept alive. Installing a
/// second global subscriber fails instead of panicking.
pub fn init_tracing(log_dir: &Path) -> Result<WorkerGuard, TryInitError> {
    let file_appender = tracing_appender::rolling::daily(log_dir, "qtl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    Registry::default().with(file_layer).try_init()?;

    Ok(guard)
}
