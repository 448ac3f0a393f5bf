//! Diagnostic logging via `tracing`.
//!
//! The long-running daemon writes JSON lines to a daily-rotated file
//! under the vault's log directory and mirrors human-readable output to
//! stderr; one-shot tool invocations get the stderr layer only. The
//! `RUST_LOG` environment variable filters both (default `info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive; dropping it flushes any
/// buffered log lines.
pub struct LoggingGuard {
    _file_writer: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Daemon-mode logging: `{logs_dir}/steward.log.YYYY-MM-DD` (JSON,
/// daily rotation) plus stderr. The returned guard must live as long as
/// the process.
///
/// # Errors
///
/// Fails when the log directory cannot be created.
pub fn init_daemon(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("failed to create log directory {}: {e}", logs_dir.display())
    })?;

    let rolling = tracing_appender::rolling::daily(logs_dir, "steward.log");
    let (file_writer, guard) = tracing_appender::non_blocking(rolling);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard {
        _file_writer: guard,
    })
}

/// Tool-mode logging: stderr only, no files.
pub fn init_tool() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}
