// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (ANKA_EXPORTER_*)
// - Validation
// - Sensible defaults
// ============================================================================

use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    DEFAULT_CARDINALITY_RESET_TTL_SECS, DEFAULT_ERROR_BACKOFF_SECS, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_LISTEN_ADDRESS, DEFAULT_MAX_AUTH_RETRIES, DEFAULT_MAX_INTERVAL_SECS,
    DEFAULT_METRICS_PATH, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SHUTDOWN_GRACE_SECS,
    MIN_INTERVAL_SECS,
};

/// Prefix for environment overrides, e.g. `ANKA_EXPORTER_CONTROLLER__ADDRESS`
pub const ENV_PREFIX: &str = "ANKA_EXPORTER_";

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Controller connection and credentials
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Poll cadence and retry bounds
    #[serde(default)]
    pub polling: PollingConfig,

    /// Ghost-series eviction
    #[serde(default)]
    pub cardinality: CardinalityConfig,

    /// Scrape endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config = Self::layered(Some(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the TOML file when given, then `ANKA_EXPORTER_*`
    /// variables. Not validated, so callers can apply overrides first.
    pub fn layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let controller = &self.controller;

        if controller.address.trim().is_empty() {
            return Err(ConfigError::missing_field("controller.address"));
        }
        if !controller.address.starts_with("http://") && !controller.address.starts_with("https://") {
            return Err(ConfigError::invalid_value(
                "controller.address",
                "must start with http:// or https://",
            ));
        }

        let has_user = controller.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_pass = controller.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_user != has_pass {
            return Err(ConfigError::ValidationFailed {
                message: "controller.username and controller.password must be set together".into(),
            });
        }

        if let Some(uak) = &controller.uak {
            if has_user {
                return Err(ConfigError::ValidationFailed {
                    message: "basic credentials and a UAK are mutually exclusive".into(),
                });
            }
            if uak.id.trim().is_empty() {
                return Err(ConfigError::missing_field("controller.uak.id"));
            }
            if uak.key_path.is_none() && uak.key_string.is_none() {
                return Err(ConfigError::invalid_value(
                    "controller.uak",
                    "one of key_path or key_string is required",
                ));
            }
        }

        let tls = &controller.tls;
        if tls.client_cert.is_some() != tls.client_cert_key.is_some() {
            return Err(ConfigError::ValidationFailed {
                message: "controller.tls.client_cert and client_cert_key must be set together".into(),
            });
        }

        let polling = &self.polling;
        if polling.max_interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "polling.max_interval_secs",
                format!("must be at least {}", MIN_INTERVAL_SECS),
            ));
        }
        if polling.interval_secs < MIN_INTERVAL_SECS || polling.interval_secs > polling.max_interval_secs {
            return Err(ConfigError::invalid_value(
                "polling.interval_secs",
                format!(
                    "must be between {} and {}",
                    MIN_INTERVAL_SECS, polling.max_interval_secs
                ),
            ));
        }
        if polling.error_backoff_secs == 0 {
            return Err(ConfigError::invalid_value(
                "polling.error_backoff_secs",
                "must be greater than zero",
            ));
        }

        if !self.server.metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                "must start with '/'",
            ));
        }
        self.server
            .listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.listen_address", e.to_string()))?;

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> Result<String, ConfigError> {
        let mut config = Self::default();
        config.controller.address = "http://localhost:8090".into();
        toml::to_string_pretty(&config).map_err(|e| ConfigError::SerializeError {
            message: e.to_string(),
        })
    }
}

/// Parse and validate a TOML document, without file or environment layers.
impl FromStr for ExporterConfig {
    type Err = ConfigError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

// ----------------------------------------------------------------------------
// Controller Configuration
// ----------------------------------------------------------------------------

/// Controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Base URL, e.g. `https://controller:8090`
    #[serde(default)]
    pub address: String,

    /// HTTP Basic username
    #[serde(default)]
    pub username: Option<String>,

    /// HTTP Basic password
    #[serde(default)]
    pub password: Option<String>,

    /// UAK credentials for the challenge-response login
    #[serde(default)]
    pub uak: Option<UakConfig>,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: None,
            password: None,
            uak: None,
            tls: TlsConfig::default(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl ControllerConfig {
    /// Address without a trailing slash
    pub fn base_url(&self) -> &str {
        self.address.trim_end_matches('/')
    }
}

/// User API Key. `key_path` wins when both sources are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UakConfig {
    pub id: String,

    /// PEM file holding the RSA private key
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Base64-encoded PKCS#1 DER private key
    #[serde(default)]
    pub key_string: Option<String>,
}

/// TLS material for the controller connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    #[serde(default)]
    pub client_cert_key: Option<PathBuf>,

    #[serde(default)]
    pub skip_verification: bool,
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// Polling Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Starting poll interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Upper bound for the scrape-driven interval
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    /// Sleep after a failed fetch
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Renew-and-refetch cycles allowed per fetch
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,

    /// Keep `interval_secs` fixed regardless of scrape cadence
    #[serde(default)]
    pub disable_interval_optimizer: bool,

    /// Time allowed for poll tasks to stop on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_interval_secs: default_max_interval(),
            error_backoff_secs: default_error_backoff(),
            max_auth_retries: default_max_auth_retries(),
            disable_interval_optimizer: false,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_interval() -> u64 {
    DEFAULT_MAX_INTERVAL_SECS
}

fn default_error_backoff() -> u64 {
    DEFAULT_ERROR_BACKOFF_SECS
}

fn default_max_auth_retries() -> u32 {
    DEFAULT_MAX_AUTH_RETRIES
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

// ----------------------------------------------------------------------------
// Cardinality Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardinalityConfig {
    /// Clear a labeled vector at least this often (seconds)
    #[serde(default = "default_reset_ttl")]
    pub reset_ttl_secs: u64,
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            reset_ttl_secs: default_reset_ttl(),
        }
    }
}

fn default_reset_ttl() -> u64 {
    DEFAULT_CARDINALITY_RESET_TTL_SECS
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            metrics_path: default_metrics_path(),
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.into()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,

    /// Emit span close events with timing
    #[serde(default)]
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
            span_events: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}
