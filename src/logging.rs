use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the config file
/// so operators can crank verbosity without editing it.
pub fn init(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rucert={},sqlx=warn", cfg.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(cfg.console_colors)
        .with_target(false)
        .init();
}
