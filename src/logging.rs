use env_logger::{Builder, Env};

use crate::config::LoggingConfig;

/// Install the global logger
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more than once is
/// harmless, later calls leave the first logger in place.
pub fn init(config: &LoggingConfig) {
    let env = Env::default().default_filter_or(config.level.as_str());
    if Builder::from_env(env).format_timestamp_millis().try_init().is_err() {
        log::debug!("logger already installed");
    }
}
