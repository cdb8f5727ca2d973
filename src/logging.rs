// macros only; no direct imports needed

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

/// Severity attached to replay-safe log entries buffered by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}
