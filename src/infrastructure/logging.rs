//! Tracing setup: optional stderr layer plus a rolling file layer.

use crate::domain::settings::LogSettings;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies log at this level unless RUST_LOG says otherwise.
const DEPENDENCY_LEVEL: &str = "warn";

pub struct LoggingGuard {
    // Dropping the guard flushes the file writer
    _guards: Vec<WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Directory the file layer writes to, if enabled.
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Directives for the configured level: this crate at `level`, everything
/// else at [`DEPENDENCY_LEVEL`]. An unknown level falls back to `info`.
fn directives(level: &str) -> String {
    let level = match level.to_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => l.to_string(),
        _ => "info".to_string(),
    };
    format!(
        "{},{}={}",
        DEPENDENCY_LEVEL,
        env!("CARGO_CRATE_NAME"),
        level
    )
}

/// Relative log directories live under `base` (the config directory).
fn resolve_log_dir(log_dir: &str, base: &Path) -> PathBuf {
    let dir = Path::new(log_dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        base.join(dir)
    }
}

pub fn init_logger(settings: &LogSettings, base_dir: &Path) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // RUST_LOG wins over the configured level
    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(&settings.level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let log_dir = settings
        .file_logging_enabled
        .then(|| resolve_log_dir(&settings.log_dir, base_dir));
    let file_layer = match &log_dir {
        Some(dir) => {
            let appender =
                RollingFileAppender::new(rotation(&settings.rotation), dir, &settings.file_name_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_file(settings.show_file_line)
                    .with_line_number(settings.show_file_line)
                    .with_thread_ids(settings.show_thread_ids)
                    .with_target(settings.show_target),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if let Some(dir) = &log_dir {
        tracing::info!("Logging to {}", dir.display());
    }

    Ok(LoggingGuard {
        _guards: guards,
        log_dir,
    })
}
