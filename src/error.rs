// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every layer of the exporter:
// - configuration loading and validation
// - controller API requests and envelope decoding
// - the UAK challenge-response handshake
// - event bus and poller bookkeeping
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

use crate::types::EventKind;
use crate::AUTH_REQUIRED_MESSAGE;

pub type ExporterResult<T> = Result<T, ExporterError>;
pub type ApiResult<T> = Result<T, ApiError>;
pub type AuthResult<T> = Result<T, AuthError>;

// ----------------------------------------------------------------------------
// Core Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Controller Errors ----
    #[error("Controller API error: {0}")]
    Api(#[from] ApiError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    // ---- Event Bus Errors ----
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Poll task for '{0}' is already running")]
    DuplicatePollTask(EventKind),

    #[error("Handler for '{expected}' received a '{actual}' payload")]
    PayloadMismatch { expected: EventKind, actual: EventKind },

    #[error("Handler failed: {0}")]
    Handler(String),

    // ---- Metric Registry Errors ----
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Api(e) => e.is_recoverable(),
            ExporterError::Auth(e) => e.is_recoverable(),
            ExporterError::UnknownEventKind(_) => false,
            ExporterError::DuplicatePollTask(_) => false,
            ExporterError::PayloadMismatch { .. } => false,
            ExporterError::Handler(_) => true,
            ExporterError::Metrics(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Api(_) => "api",
            ExporterError::Auth(_) => "auth",
            ExporterError::UnknownEventKind(_) => "event_kind",
            ExporterError::DuplicatePollTask(_) => "poller",
            ExporterError::PayloadMismatch { .. } => "payload",
            ExporterError::Handler(_) => "handler",
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ExporterError::Config(_) => RecoveryHint::FixConfiguration,
            ExporterError::Api(e) => e.recovery_hint(),
            ExporterError::Auth(e) => e.recovery_hint(),
            ExporterError::Handler(_) => RecoveryHint::Skip,
            ExporterError::UnknownEventKind(_)
            | ExporterError::DuplicatePollTask(_)
            | ExporterError::PayloadMismatch { .. }
            | ExporterError::Metrics(_)
            | ExporterError::Internal(_) => RecoveryHint::AlertOperator,
            ExporterError::Io(_) => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry after the error backoff
    RetryWithBackoff,
    /// Renew the bearer token and retry
    Reauthenticate,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Failed to serialize configuration: {message}")]
    SerializeError { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Controller API Errors
// ----------------------------------------------------------------------------

/// Errors from a single controller request
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request to '{endpoint}' failed: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("Controller returned HTTP {status} for '{endpoint}'")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Invalid response from '{endpoint}': {message}")]
    Decode { endpoint: String, message: String },

    #[error("Controller rejected '{endpoint}': {message}")]
    Upstream { endpoint: String, message: String },

    #[error("Failed to build HTTP client: {message}")]
    ClientBuild { message: String },
}

impl ApiError {
    pub fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        ApiError::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Decode {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// True when the controller reported an expired or missing session
    pub fn is_auth_required(&self) -> bool {
        matches!(self, ApiError::Upstream { message, .. } if message == AUTH_REQUIRED_MESSAGE)
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ApiError::ClientBuild { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ApiError::ClientBuild { .. } => RecoveryHint::FixConfiguration,
            e if e.is_auth_required() => RecoveryHint::Reauthenticate,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

// ----------------------------------------------------------------------------
// Authentication Errors
// ----------------------------------------------------------------------------

/// Errors from the UAK challenge-response handshake
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No UAK key configured (set key_path or key_string)")]
    KeyNotConfigured,

    #[error("Failed to read UAK key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid UAK key material: {0}")]
    KeyMaterial(String),

    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to decrypt handshake secret: {0}")]
    Decrypt(String),

    #[error("Handshake {step} request failed: {source}")]
    Request {
        step: &'static str,
        source: reqwest::Error,
    },

    #[error("Handshake {step} returned HTTP {status}")]
    Rejected { step: &'static str, status: u16 },

    #[error("Handshake shake response carried no grant data")]
    MissingGrant,

    #[error("Failed to encode grant: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AuthError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::Request { .. } | AuthError::Rejected { .. } | AuthError::MissingGrant
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        if self.is_recoverable() {
            RecoveryHint::RetryWithBackoff
        } else {
            RecoveryHint::FixConfiguration
        }
    }
}
