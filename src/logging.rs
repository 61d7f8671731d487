use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Result, ServeError};

/// Initialize console logging.
///
/// `RUST_LOG` takes precedence over the configured level. `json` emits one
/// structured record per line for log collectors; `pretty` is for humans.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_target(false).with_line_number(false))
            .try_init(),
    };

    result.map_err(|e| ServeError::Config(format!("failed to initialize logging: {}", e)))?;

    tracing::debug!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}

/// Console subscriber for the records emitted before the configuration is
/// loaded. Install it with `tracing::subscriber::with_default`.
pub fn bootstrap_subscriber(level: Option<&str>) -> impl Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_line_number(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_subscriber_filters_by_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let subscriber = bootstrap_subscriber(Some("warn"));
        tracing::subscriber::with_default(subscriber, || {
            assert!(!tracing::enabled!(tracing::Level::INFO));
            assert!(tracing::enabled!(tracing::Level::ERROR));
        });
    }
}
