use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::info;

use anka_exporter::cli::{handle_generate_config, handle_validate, handle_version, Cli, Commands};
use anka_exporter::logging::init_logging;
use anka_exporter::{Exporter, EXPORTER_FULL_NAME, EXPORTER_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't start the exporter
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = cli
        .load_config()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    init_logging(&config.logging)?;

    info!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    if !cli.config.exists() {
        info!(
            path = %cli.config.display(),
            "Config file not found, using environment and command-line settings"
        );
    }

    let exporter = Exporter::new(config).context("Failed to initialize exporter")?;
    exporter.run().await?;

    Ok(())
}
