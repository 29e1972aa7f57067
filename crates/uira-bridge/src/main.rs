//! `uira-bridge` binary entrypoint.

use anyhow::{Context, Result};
use clap::Parser;
use uira_bridge::{init_subscriber, serve, BridgeConfig, TelemetryConfig};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_subscriber(&TelemetryConfig {
        level: cli.log_level.clone(),
        json_output: cli.json_logs,
    });

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            let yaml = serde_yaml_ng::to_string(&config).context("failed to render config")?;
            print!("{}", yaml);
            Ok(())
        }
        None => serve(config).await,
    }
}
