//! JSON logging for both functions.
//!
//! `RUST_LOG` wins when set; otherwise the filter comes from `LOGGING_LEVEL`,
//! which also accepts the level names the deployment templates use.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingArgs;

/// Translates a `LOGGING_LEVEL` value into an `EnvFilter` directive.
/// Unknown names fall back to `info`.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        _ => "info",
    }
}

pub fn init_logging(args: &LoggingArgs) {
    let directive = level_directive(&args.logging_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    // A second init (warm container, tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_ansi(false)
        .try_init();
}
