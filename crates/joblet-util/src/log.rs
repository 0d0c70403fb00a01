//! Logger construction, built on `slog` + `slog-async` + `slog-term`. No global logger: every
//! constructor takes a `slog::Logger` and derives children with `o!(...)`.

use slog::{o, Drain, Level, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn to_slog(self) -> Level {
        match self {
            LogLevel::Error => Level::Error,
            LogLevel::Warn => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
        }
    }
}

/// Builds the daemon's root logger: async drain over a term decorator, filtered to `level`.
pub fn new_logger(level: LogLevel) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.to_slog()).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "joblet"))
}

/// Runs `body` with a fresh logger, ensuring the async drain is flushed (logger dropped) even if
/// `body` returns an error.
pub fn run_with_logger<T>(
    level: LogLevel,
    body: impl FnOnce(Logger) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let logger = new_logger(level);
    let result = body(logger.clone());
    drop(logger);
    result
}
