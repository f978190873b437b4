use crate::cli::TracingFormat;
use crate::config::Config;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Configure and initialize logging for the application.
///
/// `RUST_LOG` wins when set. Logs go to stderr so stdout stays parseable.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base_level = &config.log_level;
        EnvFilter::new(format!("warn,accountgeo={base_level}"))
    });

    match tracing_format {
        TracingFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .compact(),
                )
                .init();
        }
        TracingFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr)
                        .json()
                        .flatten_event(true)
                        .with_current_span(true),
                )
                .init();
        }
    }
}
