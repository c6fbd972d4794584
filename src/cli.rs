use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "raincheck",
    version,
    about = "Weather-driven irrigation rules for smart sprinkler controllers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override SQLite data directory
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one evaluation pass now
    Run,
    /// Run evaluation passes on the configured interval until interrupted
    Daemon {
        /// Override engine.interval_minutes
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Validate config and test the controller connection
    Check,
    /// Re-run interactive setup
    Init,
    /// Load devices, zones, rules and sensor readings from a YAML file
    Import {
        file: PathBuf,
    },
    /// List rules with their last run and result
    Rules,
    /// Stop all watering on a device
    Stop {
        device_id: String,
    },
}

impl Cli {
    /// Log filter directive for the requested verbosity.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
