use flowmem_simulator::SimulationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("state hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("seed {seed} failed: {source}")]
    FuzzFailure {
        seed: u64,
        #[source]
        source: SimulationError,
    },
}
