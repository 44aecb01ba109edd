//! Structured logging for worker processes
//!
//! Several workers usually share one terminal or log file, so every line is
//! emitted inside a `worker` span carrying the process id and worker index.

use tracing::Span;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::constants;

/// Span that tags every log line of this worker
pub fn worker_span(worker_index: u32) -> Span {
    tracing::info_span!("worker", pid = std::process::id(), index = worker_index)
}

/// Initialize tracing for a worker process.
///
/// Logs go to stderr filtered by `RUST_LOG`. In dev mode they go to the dev
/// log file at DEBUG instead, and the returned guard must be held until exit
/// so buffered lines are flushed.
pub fn init_worker_tracing(
    enable_dev_log: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>> {
    if enable_dev_log {
        use std::fs::OpenOptions;
        use tracing_appender::non_blocking;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(constants::dev_log_path())?;

        let (file_writer, guard) = non_blocking(file);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
            )
            .try_init()?;

        eprintln!(
            "Development logging enabled - writing to {} (PID: {})",
            constants::dev_log_path(),
            std::process::id()
        );

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
            )
            .try_init()?;

        Ok(None)
    }
}
