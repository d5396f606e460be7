//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const DEFAULT_LOG_PREFIX: &str = "device-plugin.log";

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `log_file` is given they are also written
/// to a daily rolling file next to it; the returned guard must be held until
/// exit so buffered lines get flushed.
pub fn init(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = || {
        filter::EnvFilter::builder()
            .with_default_directive(filter::LevelFilter::INFO.into())
            .from_env_lossy()
    };

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return None;
    };

    let (dir, prefix) = split_log_path(log_file);
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => {
            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).with(file_layer).init();
            Some(file_guard)
        }
        Err(err) => {
            registry().with(fmt_layer).init();
            tracing::error!(
                "failed to create rolling log file at {}: {err}; logging to stderr only",
                dir.display()
            );
            None
        }
    }
}

/// Splits a log file path into the rotation directory and file name prefix.
fn split_log_path(log_file: &Path) -> (&Path, &str) {
    if log_file.is_dir() {
        return (log_file, DEFAULT_LOG_PREFIX);
    }
    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_PREFIX);
    (dir, prefix)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn split_file_path() {
        let (dir, prefix) = split_log_path(Path::new("/var/log/plugin.log"));
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(prefix, "plugin.log");

        let (dir, prefix) = split_log_path(Path::new("plugin.log"));
        assert_eq!(dir, Path::new("."));
        assert_eq!(prefix, "plugin.log");
    }

    #[test]
    fn split_directory_uses_default_prefix() {
        let tmp = TempDir::new().expect("should create temp dir");
        let (dir, prefix) = split_log_path(tmp.path());
        assert_eq!(dir, tmp.path());
        assert_eq!(prefix, DEFAULT_LOG_PREFIX);
    }
}
