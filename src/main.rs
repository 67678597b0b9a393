//! Deep Recon - Recon Aggregation and Risk Correlation
//!
//! Main entry point for the deep_recon application.
//! Loads configuration, initializes logging and runs the CLI interface.
//!
//! Copyright (c) 2025 Deepskilling Inc
//! Licensed under the MIT License (https://opensource.org/licenses/MIT)

use anyhow::{anyhow, Result};
use clap::Parser;
use deep_recon::{cli::Cli, config::AppConfig, core::Application, logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();
    cli.validate().map_err(|e| anyhow!(e))?;

    // Load configuration and fold in command-line overrides
    let mut config = AppConfig::load(&cli.config_path).await?;
    cli.apply_overrides(&mut config);

    // The guard flushes the log file on exit
    let _log_guard = logging::init_logging_with_config(&config.logging)?;

    if cli.validate_config {
        config.validate()?;
        println!("Configuration is valid: {}", cli.config_path.display());
        return Ok(());
    }

    info!("Starting deep_recon application");

    let mut app = Application::new(config).await?;
    app.run(cli).await?;

    info!("Application completed successfully");
    Ok(())
}
