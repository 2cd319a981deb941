//! Log output: stderr by default, or a daily-rotated file with bounded history.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Rotated files kept next to the active one.
pub const LOG_FILES_KEPT: usize = 5;

/// Writer for `path` that rolls daily and prunes all but the newest
/// [`LOG_FILES_KEPT`] files. Files are named `<file name>.<date>`.
pub fn rolling_log_writer(path: &Path) -> Result<RollingFileAppender> {
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("log file {} has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Install the global logger. `RUST_LOG` filters; the default level is info.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        builder.target(env_logger::Target::Pipe(Box::new(rolling_log_writer(path)?)));
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder
        .try_init()
        .context("logger already initialized")?;
    Ok(())
}
