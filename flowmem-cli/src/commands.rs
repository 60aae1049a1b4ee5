use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use flowmem_config::FlowmemConfig;
use flowmem_core::directory::InstanceDirectory;
use flowmem_core::pool::PoolManager;
use flowmem_core::record::RecordAllocator;
use flowmem_simulator::config::load_sim_config;
use flowmem_simulator::{SimulationReport, Simulator, SimulatorConfig};
use flowmem_telemetry::MetricsRecorder;

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "flowmem", version, about)]
pub struct Cli {
    /// Configuration file; defaults to config/flowmem.yaml plus FLOWMEM_* overrides
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the backing memory each component needs for the configuration
    Size,
    /// Run one deterministic simulation
    Simulate(SimulateArgs),
    /// Run simulations over consecutive seeds until one fails
    Fuzz(FuzzArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Workload file; if not provided, sizes come from the configuration
    #[arg(short, long)]
    pub workload: Option<PathBuf>,
    #[arg(long, default_value_t = 10_000)]
    pub ops: usize,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    #[arg(long)]
    pub validate_hash: Option<String>,
    /// Print Prometheus metrics after the report
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FuzzArgs {
    /// Initial seed for fuzzing (will auto-increment)
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// Number of fuzzing iterations (0 for unlimited)
    #[arg(long, default_value_t = 0)]
    pub iterations: usize,
    /// Steps per simulation
    #[arg(long, default_value_t = 1000)]
    pub ops: usize,
}

/// Backing-memory requirement of each component, in bytes.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SizeReport {
    pub record_allocator: usize,
    pub pool_manager: usize,
    pub instance_directory: usize,
}

pub fn size_report(config: &FlowmemConfig) -> anyhow::Result<SizeReport> {
    Ok(SizeReport {
        record_allocator: RecordAllocator::size_query(
            config.record.max_records,
            config.record.max_contig_records,
        )
        .context("record allocator")?,
        pool_manager: PoolManager::size_query(config.pool.max_pools).context("pool manager")?,
        instance_directory: InstanceDirectory::size_query(
            config.directory.max_table_scopes,
            config.directory.max_regions,
        )
        .context("instance directory")?,
    })
}

pub fn run_size(config: &FlowmemConfig) -> anyhow::Result<()> {
    let report = size_report(config)?;
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

fn workload_config(
    workload: Option<&PathBuf>,
    config: &FlowmemConfig,
) -> anyhow::Result<SimulatorConfig> {
    match workload {
        Some(path) => load_sim_config(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(SimulatorConfig::from(config)),
    }
}

/// Runs the simulation and checks the expected hash, if any.
pub fn simulate(
    args: &SimulateArgs,
    config: &FlowmemConfig,
    metrics: Option<MetricsRecorder>,
) -> anyhow::Result<SimulationReport> {
    let mut simulator = Simulator::new(workload_config(args.workload.as_ref(), config)?, args.seed)?;
    if let Some(metrics) = metrics {
        simulator = simulator.with_metrics(metrics);
    }
    let report = simulator.run(args.ops)?;
    if let Some(expected) = &args.validate_hash {
        if !expected.eq_ignore_ascii_case(&report.state_hash) {
            return Err(CliError::HashMismatch {
                expected: expected.clone(),
                actual: report.state_hash,
            }
            .into());
        }
        info!("state hash validated");
    }
    Ok(report)
}

pub fn run_simulate(
    args: SimulateArgs,
    config: &FlowmemConfig,
    metrics: MetricsRecorder,
) -> anyhow::Result<()> {
    let exporter = (args.metrics || config.telemetry.metrics_enabled).then(|| metrics.clone());
    let report = simulate(&args, config, exporter)?;
    print!("{}", serde_yaml::to_string(&report)?);
    if args.metrics {
        print!("{}", metrics.gather_metrics()?);
    }
    Ok(())
}

/// Runs `iterations` seeds starting at `seed` (unbounded when 0) and returns
/// how many passed before stopping.
pub fn fuzz(args: &FuzzArgs, config: &FlowmemConfig) -> anyhow::Result<usize> {
    let workload = SimulatorConfig::from(config);
    let mut passed = 0;
    let mut seed = args.seed;
    while args.iterations == 0 || passed < args.iterations {
        let outcome = Simulator::new(workload.clone(), seed).and_then(|mut sim| sim.run(args.ops));
        if let Err(source) = outcome {
            warn!(seed, %source, "fuzz seed failed");
            return Err(CliError::FuzzFailure { seed, source }.into());
        }
        passed += 1;
        seed = seed.wrapping_add(1);
    }
    Ok(passed)
}

pub fn run_fuzz(args: FuzzArgs, config: &FlowmemConfig) -> anyhow::Result<()> {
    let passed = fuzz(&args, config)?;
    info!(passed, first_seed = args.seed, "fuzzing finished");
    println!("{passed} seeds passed");
    Ok(())
}
