use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sets up the logging subscriber for the exporter.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_logger(default_level: Level) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},tower_http=info",
            env!("CARGO_CRATE_NAME"),
            default_level
        ))
    });

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    // A second initialisation (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Hides credentials in a data source name before it is logged.
pub fn mask_dsn(dsn: &str) -> String {
    match dsn.split_once('@') {
        Some((_, host)) => format!("***@{}", host),
        None => dsn.to_string(),
    }
}
