//! Logging setup and the pluggable `Logger` collaborator.

/// Initialize tracing for the application.
///
/// Uses a simple `with_max_level` configuration based on `default_level`.
pub fn init(default_level: &str) {
    let lvl = parse_level(default_level);

    // try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Minimal logging capability a host can inject with `BusAdapter::set_logger`.
///
/// Transports report connection lifecycle messages here in addition to
/// emitting them through `tracing`.
pub trait Logger: Send + Sync {
    fn info(&self, message: &str);

    fn warn(&self, message: &str) {
        self.info(message);
    }

    fn debug(&self, message: &str) {
        let _ = message;
    }
}
