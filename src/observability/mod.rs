//! Observability
//!
//! Structured logging through `tracing`. Log lines always go to stderr so
//! stdout stays reserved for the protocol output of the binary.

mod config;

pub use config::{LogConfig, LogFormat};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Fails if the filter directive is invalid or a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match config.format {
        LogFormat::Json => builder.json().try_init()?,
        LogFormat::Text => builder.try_init()?,
    }
    Ok(())
}

/// Root span carrying the service identity; enter it for the process lifetime
pub fn service_span(config: &LogConfig) -> tracing::Span {
    tracing::info_span!(
        "service",
        name = %config.service_name,
        env = %config.env,
        version = %config.version,
        tags = %config.formatted_tags().join(","),
    )
}
