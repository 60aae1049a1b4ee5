//! # flowmem-core
//!
//! Record and pool bookkeeping for hardware flow-table memory.
//! Every structure lives inside a caller-supplied byte region and never
//! allocates on its own.
//!
//! ### Key Submodules:
//! - `bitset`: MSB-first bit array with all-or-nothing range updates
//! - `region`: carving a byte region into typed little-endian tables
//! - `record`: block-and-bitmap allocator for power-of-two record groups
//! - `pool`: pool-id allocator with per-pool owner (FID) tracking
//! - `directory`: dense `(table scope, region, direction)` handle lookup
//!
//! ### Threading:
//! Nothing here locks. Mutating calls take `&mut self`, so callers
//! serialise access the same way they would for any owned value.

pub mod bitset;
pub mod directory;
pub mod error;
pub mod pool;
pub mod record;
pub(crate) mod region;

pub mod prelude {
    pub use crate::bitset::Bitset;
    pub use crate::directory::{
        Direction, InstanceDirectory, InstanceHandle, RegionType, ScopeEntries, ScopeEntry,
    };
    pub use crate::error::*;
    pub use crate::pool::{Fid, OwnedPools, OwnerCursor, PoolId, PoolManager};
    pub use crate::record::{Allocation, RecordAllocator, SizeClass, Usage};
}

pub use error::{AllocError, ErrorKind, InvariantViolation};
