use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const LOG_ENV: &str = "FIXVK_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with environment filter.
/// Set FIXVK_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but leaves an already-installed subscriber alone.
///
/// The bridge is usually loaded into a host process that may have set up its
/// own subscriber. Returns `true` if ours was installed.
pub fn try_init_logging() -> bool {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
