//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uira_bridge::BridgeConfig;

#[derive(Parser, Debug)]
#[command(name = "uira-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to a YAML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Default model when a request does not name one
    #[arg(short, long)]
    pub model: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration as YAML and exit
    CheckConfig,
}

impl Cli {
    /// Flags are the last configuration layer.
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = &self.model {
            config.default_model = model.clone();
        }
    }
}
