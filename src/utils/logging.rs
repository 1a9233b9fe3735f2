use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::core::config::Config;

/// Crate-scoped filter directive for a level, e.g. `manga_crosspage=info`
pub fn filter_directive(level: Level) -> String {
    format!(
        "manga_crosspage={}",
        match level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    )
}

/// Install a fmt subscriber filtered to this crate at the configured level.
///
/// Returns `false` if a global subscriber was already set (the embedding
/// orchestrator owns logging in that case).
pub fn init_tracing(config: &Config) -> bool {
    let filter = EnvFilter::new(filter_directive(config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}
