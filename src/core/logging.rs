use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MODEL_ENGINE_LOG";

/// Installs the global subscriber. Later calls leave the first one in place.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
