//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter is chosen in this order:
//! 1. `CONDUCTOR_LOG`, any `EnvFilter` directive (e.g. "conductor=debug")
//! 2. debug level when `init_with_debug(true)` or `CONDUCTOR_DEBUG=1`
//! 3. info
//!
//! Output goes to stderr.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CONDUCTOR_LOG";
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Install the global subscriber at info level.
pub fn init() {
    init_with_debug(false);
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_with_debug(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// True when debug output was requested through the environment.
pub fn is_debug_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn filter(debug: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    EnvFilter::new(default_directive(debug || is_debug_env()))
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
