//! Tracing subscriber setup for applications embedding the library.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{self, Config};

/// Install a global subscriber: stderr output plus an optional log file.
///
/// `RUST_LOG` overrides `level`. Returns `false` if a global subscriber was
/// already installed.
pub fn init(level: &str, config: &Config) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if config.general.log_to_file && std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailsummary.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init()
            .is_ok()
    }
}

/// [`init`] with the level from `config`.
pub fn init_from_config(config: &Config) -> bool {
    init(&config.general.log_level, config)
}
