// ============================================================================
// COMMAND LINE INTERFACE
// ============================================================================
// Subcommands, config file handling and per-run overrides. Flags given on
// the command line win over the config file and the environment.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::{ExporterConfig, UakConfig};
use crate::error::{ConfigError, ExporterError, ExporterResult};
use crate::{EXPORTER_FULL_NAME, EXPORTER_NAME, EXPORTER_VERSION};

// ----------------------------------------------------------------------------
// Argument Parser
// ----------------------------------------------------------------------------

/// Anka Build Cloud Prometheus exporter
#[derive(Parser, Debug)]
#[command(
    name = "anka-exporter",
    author = "AIOps Team",
    version,
    about = "Prometheus exporter for Anka Build Cloud controllers",
    long_about = "Polls an Anka Build Cloud controller for nodes, instances, registry \
                  and status data and serves it as Prometheus gauges. The poll cadence \
                  follows the scrape cadence."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "anka-exporter.toml", env = "ANKA_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "ANKA_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(flatten)]
    pub overrides: Overrides,

    /// Subcommand to run (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Settings that can be given per run instead of in the config file
#[derive(clap::Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Controller URL, e.g. http://anka.controller:8090
    #[arg(long, global = true)]
    pub controller_address: Option<String>,

    /// Controller username (basic auth)
    #[arg(long, global = true)]
    pub controller_username: Option<String>,

    /// Controller password (basic auth)
    #[arg(long, global = true)]
    pub controller_password: Option<String>,

    /// UAK id
    #[arg(long, global = true)]
    pub uak_id: Option<String>,

    /// Path to the UAK private key (PEM)
    #[arg(long, global = true)]
    pub uak_path: Option<PathBuf>,

    /// UAK private key as base64 DER
    #[arg(long, global = true)]
    pub uak_string: Option<String>,

    /// Initial poll interval in seconds
    #[arg(long, global = true)]
    pub interval: Option<u64>,

    /// Scrape endpoint address, e.g. 0.0.0.0:2112
    #[arg(long, global = true)]
    pub listen_address: Option<String>,

    /// Keep the poll interval fixed instead of following scrapes
    #[arg(long, global = true)]
    pub disable_interval_optimizer: bool,

    /// Accept any TLS certificate from the controller
    #[arg(long, global = true)]
    pub skip_tls_verification: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut ExporterConfig) {
        let controller = &mut config.controller;
        if let Some(address) = &self.controller_address {
            controller.address = address.clone();
        }
        if let Some(username) = &self.controller_username {
            controller.username = Some(username.clone());
        }
        if let Some(password) = &self.controller_password {
            controller.password = Some(password.clone());
        }

        if self.uak_id.is_some() || self.uak_path.is_some() || self.uak_string.is_some() {
            let uak = controller.uak.get_or_insert_with(UakConfig::default);
            if let Some(id) = &self.uak_id {
                uak.id = id.clone();
            }
            if let Some(path) = &self.uak_path {
                uak.key_path = Some(path.clone());
            }
            if let Some(key) = &self.uak_string {
                uak.key_string = Some(key.clone());
            }
        }

        if self.skip_tls_verification {
            controller.tls.skip_verification = true;
        }
        if let Some(interval) = self.interval {
            config.polling.interval_secs = interval;
        }
        if self.disable_interval_optimizer {
            config.polling.disable_interval_optimizer = true;
        }
        if let Some(listen_address) = &self.listen_address {
            config.server.listen_address = listen_address.clone();
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the exporter
    Run,

    /// Validate configuration
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

impl Cli {
    /// Config file (when present), environment, then command-line overrides,
    /// validated as a whole.
    pub fn load_config(&self) -> Result<ExporterConfig, ConfigError> {
        let path = self.config.exists().then_some(self.config.as_path());
        let mut config = ExporterConfig::layered(path)?;
        self.overrides.apply(&mut config);

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.debug {
            config.logging.level = "debug".into();
        }

        config.validate()?;
        Ok(config)
    }
}

// ----------------------------------------------------------------------------
// Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
pub fn handle_validate(cli: &Cli, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration: {}", cli.config.display());

    match cli.load_config() {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            let auth = if config.controller.uak.is_some() {
                "UAK"
            } else if config.controller.username.is_some() {
                "basic"
            } else {
                "none"
            };
            println!("\nSummary:");
            println!("  Controller: {}", config.controller.address);
            println!("  Authentication: {}", auth);
            println!(
                "  Poll interval: {}s (max {}s, optimizer {})",
                config.polling.interval_secs,
                config.polling.max_interval_secs,
                if config.polling.disable_interval_optimizer { "off" } else { "on" }
            );
            println!(
                "  Scrape endpoint: {}{}",
                config.server.listen_address, config.server.metrics_path
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
pub fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
pub fn handle_version() {
    println!("{} ({}) v{}", EXPORTER_FULL_NAME, EXPORTER_NAME, EXPORTER_VERSION);
    println!("  Target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["anka-exporter", "--config", "/nonexistent/anka-exporter.toml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = parse(&["--controller-address", "http://c:8090"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.overrides.controller_address.as_deref(), Some("http://c:8090"));
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let cli = parse(&[
            "--controller-address",
            "http://c:8090",
            "--interval",
            "30",
            "--listen-address",
            "127.0.0.1:9999",
            "--disable-interval-optimizer",
            "--debug",
        ]);

        Jail::expect_with(|jail| {
            jail.set_env("ANKA_EXPORTER_POLLING__INTERVAL_SECS", "20");
            jail.set_env("ANKA_EXPORTER_POLLING__ERROR_BACKOFF_SECS", "3");

            let config = cli.load_config().unwrap();
            assert_eq!(config.controller.address, "http://c:8090");
            assert_eq!(config.polling.interval_secs, 30);
            assert_eq!(config.polling.error_backoff_secs, 3);
            assert!(config.polling.disable_interval_optimizer);
            assert_eq!(config.server.listen_address, "127.0.0.1:9999");
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_uak_flags_build_uak_section() {
        let cli = parse(&[
            "--controller-address",
            "http://c:8090",
            "--uak-id",
            "exporter",
            "--uak-string",
            "ZmFrZQ==",
        ]);

        Jail::expect_with(|_| {
            let config = cli.load_config().unwrap();
            let uak = config.controller.uak.unwrap();
            assert_eq!(uak.id, "exporter");
            assert_eq!(uak.key_string.as_deref(), Some("ZmFrZQ=="));
            Ok(())
        });
    }

    #[test]
    fn test_overrides_are_validated() {
        let cli = parse(&["--controller-address", "http://c:8090", "--interval", "1"]);
        Jail::expect_with(|_| {
            assert!(matches!(
                cli.load_config(),
                Err(ConfigError::InvalidValue { ref field, .. }) if field == "polling.interval_secs"
            ));
            Ok(())
        });
    }

    #[test]
    fn test_subcommands_parse() {
        let cli = parse(&["validate", "--verbose"]);
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = parse(&["generate-config", "-o", "/tmp/out.toml"]);
        assert!(matches!(cli.command, Some(Commands::GenerateConfig { output: Some(_) })));
    }

    #[test]
    fn test_generate_config_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anka-exporter.toml");
        handle_generate_config(Some(&path)).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let config: ExporterConfig = written.parse().unwrap();
        assert_eq!(config.controller.address, "http://localhost:8090");
    }
}
