// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`, with json, compact and pretty output
// and `RUST_LOG` overrides on top of the configured level.
// ============================================================================

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

/// Map a configured level name onto a filter, defaulting to INFO
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_span_events(span_events)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_span_events(span_events),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Compact format (default)
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_span_events(span_events),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "anka_exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}
