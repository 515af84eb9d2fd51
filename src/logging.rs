use std::fs::File;
use std::sync::Mutex;

use clap_verbosity_flag::Level as Verbosity;
use tracing::Level;

/// Maps `-v`/`-q` onto a tracing level. The default (warn) keeps the
/// shell quiet; each `-v` adds one level.
pub fn log_level(verbosity: Option<Verbosity>) -> Option<Level> {
    match verbosity {
        None => None,
        Some(Verbosity::Error) => Some(Level::ERROR),
        Some(Verbosity::Warn) => Some(Level::WARN),
        Some(Verbosity::Info) => Some(Level::INFO),
        Some(Verbosity::Debug) => Some(Level::DEBUG),
        Some(Verbosity::Trace) => Some(Level::TRACE),
    }
}

/// Installs the global subscriber: stderr, or `file` without colors.
/// `None` disables logging. Installing twice is a no-op.
pub fn logging_setup(level: Option<Level>, file: Option<File>) {
    let Some(level) = level else {
        return;
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);
    let _ = match file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}
