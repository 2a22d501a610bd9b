//! Structured logging utilities for strata components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use strata_config::{log_fetch_debug, log_origin_warn};
//!
//! log_fetch_debug!("Ticket created", chunk = 7);
//! log_origin_warn!("Probe failed", root = "public");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DAEMON: &'static str = "DAEMON";
    pub const STORE: &'static str = "STORE";
    pub const META: &'static str = "META";
    pub const ORIGIN: &'static str = "ORIGIN";
    pub const FETCH: &'static str = "FETCH";
    pub const ROOTS: &'static str = "ROOTS";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

// === FETCH logging macros ===

#[macro_export]
macro_rules! log_fetch_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FETCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fetch_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FETCH", $($key = $value,)* $msg)
    };
}

// === ORIGIN logging macros ===

#[macro_export]
macro_rules! log_origin_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "ORIGIN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_origin_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "ORIGIN", $($key = $value,)* $msg)
    };
}

// === ROOTS logging macros ===

#[macro_export]
macro_rules! log_roots_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "ROOTS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_roots_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "ROOTS", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
