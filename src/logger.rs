//! Injected logging sink.
//!
//! Every component receives an `Arc<dyn Logger>` when it is constructed, so the
//! reactor never reaches for global logging state. Library users implement
//! [`Logger`] to route messages wherever they prefer, or use [`TracingLogger`]
//! to forward into the `tracing` ecosystem.

use std::sync::Arc;

/// Log levels for reactor and connection diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Emitted right before the reactor panics on an unrecoverable condition.
    Fatal,
}

/// Logger trait for reactor events
///
/// Implementations must be thread-safe: the same sink is shared by the main
/// loop and every worker loop.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards every message to the matching `tracing` macro.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Fatal => tracing::error!(fatal = true, "{}", message),
        }
    }
}

pub(crate) fn default_logger() -> Arc<dyn Logger> {
    Arc::new(NoOpLogger)
}

/// Logs `message` at [`LogLevel::Fatal`] and panics with the same text.
pub(crate) fn fatal(logger: &dyn Logger, message: &str) -> ! {
    logger.log(LogLevel::Fatal, message);
    panic!("{}", message);
}
