use std::path::Path;

use flowmem_config::FlowmemConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geometry and pacing of one simulated workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_max_records")]
    pub max_records: u32,
    #[serde(default = "default_max_contig_records")]
    pub max_contig_records: u16,
    #[serde(default = "default_max_pools")]
    pub max_pools: u16,
    /// FIDs drawn for ownership, `0..fids`.
    #[serde(default = "default_fids")]
    pub fids: u16,
    /// Full audit interval in steps; 0 audits only at the end.
    #[serde(default = "default_verify_every")]
    pub verify_every: usize,
}

fn default_max_records() -> u32 {
    4096
}

fn default_max_contig_records() -> u16 {
    8
}

fn default_max_pools() -> u16 {
    64
}

fn default_fids() -> u16 {
    8
}

fn default_verify_every() -> usize {
    256
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_contig_records: default_max_contig_records(),
            max_pools: default_max_pools(),
            fids: default_fids(),
            verify_every: default_verify_every(),
        }
    }
}

impl From<&FlowmemConfig> for SimulatorConfig {
    fn from(config: &FlowmemConfig) -> Self {
        Self {
            max_records: config.record.max_records,
            max_contig_records: config.record.max_contig_records,
            max_pools: config.pool.max_pools,
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum SimConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    Serde(#[from] serde_yaml::Error),
}

/// Loads a workload description from a YAML file.
pub fn load_sim_config<P: AsRef<Path>>(path: P) -> Result<SimulatorConfig, SimConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SimConfigError::FileNotFound(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let config: SimulatorConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
