//! # Anka Exporter
//!
//! Pulls fleet and inventory data from an Anka Build Cloud controller and
//! republishes it as labeled Prometheus gauges.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              ANKA EXPORTER                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SCRAPE → INTERVAL CONTROLLER → POLLERS → COMMUNICATOR (+ UAK SESSION)      │
//! │        POLLERS → EVENT BUS → METRIC HANDLERS → CARDINALITY GUARD → REGISTRY │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - One polling task per data domain (nodes, instances, registry disk,
//!   registry templates, controller status).
//! - Poll cadence follows the observed scrape cadence, clamped to
//!   `[MIN_INTERVAL_SECS, max_interval_secs]`.
//! - Requests authenticate with HTTP Basic or a bearer token obtained through
//!   the UAK challenge-response handshake, renewed on expiry.
//! - Labeled gauge vectors are cleared when the number of tracked entities
//!   changes, so series for vanished nodes or instances do not linger.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod auth;
pub mod cache;
pub mod cardinality;
pub mod cli;
pub mod communicator;
pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod interval;
pub mod logging;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ExporterConfig;
pub use context::ExporterContext;
pub use error::{ExporterError, ExporterResult};
pub use exporter::Exporter;
pub use types::{EventKind, Payload};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "anka-exporter";
pub const EXPORTER_FULL_NAME: &str = "Anka Prometheus Exporter";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Lower bound of the shared poll interval (seconds)
pub const MIN_INTERVAL_SECS: u64 = 2;

/// Default upper bound of the shared poll interval (seconds)
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 60;

/// Poll interval used until the first scrape retunes it (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Sleep after a failed fetch, independent of the poll interval (seconds)
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 10;

/// Scrape-to-scrape drift tolerated before the interval is retuned (seconds)
pub const INTERVAL_DRIFT_TOLERANCE_SECS: u64 = 1;

/// Window after which a labeled vector is cleared even if its size is stable
pub const DEFAULT_CARDINALITY_RESET_TTL_SECS: u64 = 600;

/// Controller request timeout (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Time allowed for poll tasks and the scrape server to wind down
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// Controller API
// ----------------------------------------------------------------------------

/// Envelope status of a successful controller response
pub const STATUS_OK: &str = "OK";

/// Envelope message returned when the bearer token has expired
pub const AUTH_REQUIRED_MESSAGE: &str = "Authentication Required";

/// Extra renew-and-refetch cycles allowed for one fetch
pub const DEFAULT_MAX_AUTH_RETRIES: u32 = 2;

// ----------------------------------------------------------------------------
// Scrape Server
// ----------------------------------------------------------------------------

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:2112";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
