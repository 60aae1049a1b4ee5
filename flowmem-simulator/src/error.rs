use flowmem_core::{AllocError, InvariantViolation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("allocator error: {0}")]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// The allocator and the shadow model disagree.
    #[error("step {step}: shadow model diverged: {detail}")]
    Divergence { step: usize, detail: String },

    #[error("invalid simulator configuration: {0}")]
    Config(String),
}
