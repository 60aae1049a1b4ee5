//! ## flowmem-cli
//! **Operator entrypoint**
//!
//! Prints backing-memory sizes for a configuration and drives seeded
//! simulations of the allocators.

use clap::Parser;
use flowmem_config::FlowmemConfig;
use flowmem_telemetry::{EventLogger, MetricsRecorder};

mod commands;
mod error;

use commands::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FlowmemConfig::load_from_path(path)?,
        None => FlowmemConfig::load()?,
    };
    if let Err(err) = EventLogger::init(&config.telemetry.log_filter) {
        eprintln!("logging disabled: {err}");
    }
    let metrics = MetricsRecorder::new()?;

    match cli.command {
        Commands::Size => commands::run_size(&config),
        Commands::Simulate(args) => commands::run_simulate(args, &config, metrics),
        Commands::Fuzz(args) => commands::run_fuzz(args, &config),
    }
}
