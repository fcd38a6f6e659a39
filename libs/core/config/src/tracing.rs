use crate::{env_or_default, Environment};
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre for binaries.
///
/// Shows the file:line where a report was created and leaves out the
/// environment section. Calling it twice is harmless.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Output format of the fmt layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, fields flattened
    Json,
    /// Multi-line human readable output
    Pretty,
}

impl LogFormat {
    /// `LOG_FORMAT=json|pretty` wins; otherwise JSON in production and pretty
    /// everywhere else.
    pub fn resolve(environment: &Environment) -> Self {
        match env_or_default("LOG_FORMAT", "").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ if environment.is_production() => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Default directives when `RUST_LOG` is not set.
///
/// The AMQP client is chatty at debug level, so it is held back a notch in
/// both environments.
pub fn default_directives(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info,lapin=warn"
    } else {
        "debug,lapin=info"
    }
}

/// Initialize the global `tracing` subscriber.
///
/// Layers: the fmt layer in the format picked by [`LogFormat::resolve`], an
/// [`EnvFilter`] from `RUST_LOG` (falling back to [`default_directives`]),
/// and `tracing_error::ErrorLayer` so eyre reports carry span traces.
///
/// Environment variables:
/// - `APP_ENV`: "production" switches the defaults to JSON / info
/// - `LOG_FORMAT`: force "json" or "pretty"
/// - `RUST_LOG`: override log levels (e.g., "messaging=trace,lapin=warn")
///
/// Calling it again once a subscriber is set is a no-op, which keeps tests
/// that each initialize logging working.
///
/// ```ignore
/// use tracing::instrument;
/// use eyre::{Result, WrapErr};
///
/// #[instrument(skip(config), fields(host = %config.host))]
/// async fn connect(config: &AmqpConfig) -> Result<AmqpClient> {
///     AmqpClient::connect(config)
///         .await
///         .wrap_err("Failed to connect to RabbitMQ")
/// }
/// ```
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));
    let format = LogFormat::resolve(environment);

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init(),
    };

    match result {
        Ok(()) => info!(?environment, ?format, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized, skipping"),
    }
}
