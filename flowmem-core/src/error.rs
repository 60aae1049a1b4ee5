use thiserror::Error;

/// Coarse classification of every [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameter, bad instance, or a request that contradicts current state.
    Validation,
    /// Nothing left to hand out.
    Exhaustion,
    /// The queried record, pool or owner is not currently allocated.
    NotFound,
}

/// Errors returned by the record allocator, pool manager and instance directory.
///
/// A failed call never mutates the instance it was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("{param} = {value} is out of range")]
    OutOfRange { param: &'static str, value: u64 },

    #[error("backing memory holds {provided} bytes, {required} required")]
    MemoryTooSmall { provided: usize, required: usize },

    #[error("backing memory does not carry a valid instance signature")]
    BadSignature,

    #[error("free of {requested} records in a block locked to {locked}-record groups")]
    SizeClassMismatch { requested: u16, locked: u16 },

    #[error("records {offset}..+{count} overlap a live allocation")]
    AlreadyAllocated { offset: u32, count: u32 },

    #[error("records {offset}..+{count} are not allocated")]
    NotAllocated { offset: u32, count: u32 },

    #[error("pool {pool_id} is already owned by fid {owner}")]
    OwnerConflict { pool_id: u16, owner: u16 },

    #[error("pool {pool_id} is not owned by fid {fid}")]
    OwnerMismatch { pool_id: u16, fid: u16 },

    #[error("pool {pool_id} is still owned by fid {owner}")]
    PoolOwned { pool_id: u16, owner: u16 },

    #[error("pool {0} is not allocated")]
    PoolNotAllocated(u16),

    #[error("resources exhausted ({used} in use, all used: {all_used})")]
    Exhausted { used: u32, all_used: bool },

    #[error("entry not found")]
    NotFound,
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::Exhausted { .. } => ErrorKind::Exhaustion,
            AllocError::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Validation,
        }
    }

    pub(crate) fn out_of_range(param: &'static str, value: impl Into<u64>) -> Self {
        AllocError::OutOfRange {
            param,
            value: value.into(),
        }
    }
}

/// A broken internal invariant found by an audit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub String);
