//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "awox-bridge")]
#[command(author, version, about = "AwoX BLE mesh to MQTT bridge", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "awox-bridge.toml")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
