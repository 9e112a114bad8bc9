use crate::config::AppConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Install the global tracing subscriber. The filter comes from `RUST_LOG`
/// when set, falling back to the configured log level; the format is JSON
/// unless the configuration asks for human-readable output.
pub fn init_subscriber(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = Registry::default().with(filter);

    let result = if config.log_format == "json" {
        tracing::subscriber::set_global_default(subscriber.with(fmt::layer().json()))
    } else {
        tracing::subscriber::set_global_default(subscriber.with(fmt::layer().compact()))
    };

    if result.is_ok() {
        // Route `log` records (sqlx, sea-orm) through tracing as well.
        let _ = tracing_log::LogTracer::init();
    }
}
