// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Installs the global tracing subscriber from the [log] settings.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

pub fn init(cfg: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match cfg.format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(true)
                .finish(),
        ),
        LogFormat::Text => tracing::subscriber::set_global_default(
            fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .compact()
                .finish(),
        ),
    };

    if installed.is_err() {
        // Default subscriber already installed; this is fine in tests.
    }
}
