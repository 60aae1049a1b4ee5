//! ## flowmem-core::pool
//! **Pool-id allocator with owner tracking**
//!
//! Pool ids come from a fixed universe `[0, max_pools)`. Each allocated pool
//! is either unowned or owned by exactly one function id (FID). A pool must
//! be disowned before it can be freed.
//!
//! Searching by owner does not touch the manager: [`OwnerCursor`] carries its
//! own position, so any number of scans can run side by side and the manager
//! may be mutated between steps of a cursor.

use std::fmt;

use tracing::{debug, warn};

use crate::bitset::Bitset;
use crate::error::AllocError;
use crate::region::{read_u16, stored_signature, write_u16, write_u32, Carver, Table};

pub type PoolId = u16;
pub type Fid = u16;

/// Largest `max_pools` accepted.
pub const MAX_POOLS: u16 = 1040;

const SIGNATURE: u32 = 0xF10A_B001;
const HEADER_SIZE: usize = 16;
/// Owner-table value of a pool nobody owns; never a valid FID.
const UNOWNED: u16 = 0xFFFF;

pub struct PoolManager<'a> {
    header: &'a mut [u8],
    present: Bitset<'a>,
    owners: Table<'a, u16>,
    spare: &'a mut [u8],
    max_pools: u16,
}

fn db_size(max_pools: u16) -> usize {
    HEADER_SIZE + Bitset::bytes_for(u32::from(max_pools)) + usize::from(max_pools) * 2
}

fn check_max_pools(max_pools: u16) -> Result<(), AllocError> {
    if (1..=MAX_POOLS).contains(&max_pools) {
        Ok(())
    } else {
        Err(AllocError::out_of_range("max_pools", max_pools))
    }
}

impl<'a> PoolManager<'a> {
    pub fn size_query(max_pools: u16) -> Result<usize, AllocError> {
        check_max_pools(max_pools)?;
        Ok(db_size(max_pools))
    }

    pub fn open(memory: &'a mut [u8], max_pools: u16) -> Result<Self, AllocError> {
        check_max_pools(max_pools).inspect_err(|_| warn!(max_pools, "invalid max_pools"))?;
        let required = db_size(max_pools);
        if memory.len() < required {
            warn!(provided = memory.len(), required, "pool manager memory too small");
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }

        memory.fill(0);
        let mut manager = Self::carve(memory, max_pools)?;
        write_u32(manager.header, 0, SIGNATURE);
        write_u16(manager.header, 4, max_pools);
        for pool_id in 0..usize::from(max_pools) {
            manager.owners.set(pool_id, &UNOWNED);
        }
        debug!(max_pools, bytes = required, "pool manager opened");
        Ok(manager)
    }

    /// Binds to a region initialised earlier by [`PoolManager::open`].
    pub fn attach(memory: &'a mut [u8]) -> Result<Self, AllocError> {
        if memory.len() < HEADER_SIZE || stored_signature(memory) != Some(SIGNATURE) {
            return Err(AllocError::BadSignature);
        }
        let max_pools = read_u16(memory, 4);
        check_max_pools(max_pools)?;
        let required = db_size(max_pools);
        if memory.len() < required {
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }
        Self::carve(memory, max_pools)
    }

    fn carve(memory: &'a mut [u8], max_pools: u16) -> Result<Self, AllocError> {
        let mut carver = Carver::new(memory);
        let header = carver.bytes(HEADER_SIZE);
        let present = Bitset::new(
            carver.bytes(Bitset::bytes_for(u32::from(max_pools))),
            u32::from(max_pools),
        )?;
        let owners = carver.table(usize::from(max_pools));
        Ok(Self {
            header,
            present,
            owners,
            spare: carver.finish(),
            max_pools,
        })
    }

    /// Zeroes the backing memory and releases it.
    pub fn close(self) {
        let Self {
            header,
            present,
            mut owners,
            spare,
            ..
        } = self;
        header.fill(0);
        present.into_inner().fill(0);
        owners.wipe();
        spare.fill(0);
        debug!("pool manager closed");
    }

    pub fn max_pools(&self) -> u16 {
        self.max_pools
    }

    pub fn pools_in_use(&self) -> u16 {
        read_u16(self.header, 6)
    }

    fn set_pools_in_use(&mut self, count: u16) {
        write_u16(self.header, 6, count);
    }

    /// Opaque per-instance metadata, conventionally log2 of the records per pool.
    pub fn pool_size_set(&mut self, exp: u8) {
        self.header[8] = exp;
    }

    pub fn pool_size_get(&self) -> u8 {
        self.header[8]
    }

    fn check_id(&self, pool_id: PoolId) -> Result<(), AllocError> {
        debug_assert_eq!(stored_signature(self.header), Some(SIGNATURE));
        if pool_id < self.max_pools {
            Ok(())
        } else {
            warn!(pool_id, max_pools = self.max_pools, "pool id out of range");
            Err(AllocError::out_of_range("pool_id", pool_id))
        }
    }

    fn is_allocated(&self, pool_id: PoolId) -> Result<bool, AllocError> {
        self.present.test(u32::from(pool_id))
    }

    fn owner(&self, pool_id: PoolId) -> Option<Fid> {
        match self.owners.get(usize::from(pool_id)) {
            UNOWNED => None,
            fid => Some(fid),
        }
    }

    /// Allocates the lowest free pool id. New pools are unowned.
    pub fn alloc(&mut self) -> Result<PoolId, AllocError> {
        let Some(found) = self.present.next_clear(0, u32::from(self.max_pools)) else {
            let used = self.pools_in_use();
            warn!(used, "no free pool ids");
            return Err(AllocError::Exhausted {
                used: u32::from(used),
                all_used: used >= self.max_pools,
            });
        };
        self.present.set_range(found, 1)?;
        let pool_id = found as PoolId;
        self.owners.set(usize::from(pool_id), &UNOWNED);
        self.set_pools_in_use(self.pools_in_use() + 1);
        Ok(pool_id)
    }

    /// Frees an unowned pool.
    pub fn free(&mut self, pool_id: PoolId) -> Result<(), AllocError> {
        self.check_id(pool_id)?;
        if !self.is_allocated(pool_id)? {
            warn!(pool_id, "freeing a pool that is not allocated");
            return Err(AllocError::PoolNotAllocated(pool_id));
        }
        if let Some(owner) = self.owner(pool_id) {
            warn!(pool_id, owner, "freeing a pool that is still owned");
            return Err(AllocError::PoolOwned { pool_id, owner });
        }
        self.present.clear_range(u32::from(pool_id), 1)?;
        self.set_pools_in_use(self.pools_in_use() - 1);
        Ok(())
    }

    /// Makes `fid` the owner of `pool_id`. Adding the current owner again succeeds.
    pub fn owner_add(&mut self, pool_id: PoolId, fid: Fid) -> Result<(), AllocError> {
        self.check_id(pool_id)?;
        if fid == UNOWNED {
            return Err(AllocError::out_of_range("fid", fid));
        }
        if !self.is_allocated(pool_id)? {
            warn!(pool_id, fid, "owning a pool that is not allocated");
            return Err(AllocError::PoolNotAllocated(pool_id));
        }
        match self.owner(pool_id) {
            Some(owner) if owner != fid => {
                warn!(pool_id, fid, owner, "pool already has a different owner");
                Err(AllocError::OwnerConflict { pool_id, owner })
            }
            _ => {
                self.owners.set(usize::from(pool_id), &fid);
                Ok(())
            }
        }
    }

    pub fn owner_remove(&mut self, pool_id: PoolId, fid: Fid) -> Result<(), AllocError> {
        self.check_id(pool_id)?;
        if self.owner(pool_id) != Some(fid) {
            warn!(pool_id, fid, "fid does not own pool");
            return Err(AllocError::OwnerMismatch { pool_id, fid });
        }
        self.owners.set(usize::from(pool_id), &UNOWNED);
        Ok(())
    }

    /// Owner of an allocated pool; `NotFound` when unallocated or unowned.
    pub fn find_owner(&self, pool_id: PoolId) -> Result<Fid, AllocError> {
        self.check_id(pool_id)?;
        if !self.is_allocated(pool_id)? {
            return Err(AllocError::NotFound);
        }
        self.owner(pool_id).ok_or(AllocError::NotFound)
    }

    /// Pools owned by `fid`, ascending.
    pub fn find_pools_by_owner(&self, fid: Fid) -> OwnedPools<'_, 'a> {
        OwnedPools {
            manager: self,
            cursor: OwnerCursor::new(fid),
        }
    }

    pub fn owned_count(&self, fid: Fid) -> usize {
        self.find_pools_by_owner(fid).count()
    }

    /// Disowns every pool held by `fid`, leaving the pools allocated.
    /// Returns how many pools were released.
    pub fn release_owner(&mut self, fid: Fid) -> usize {
        let mut cursor = OwnerCursor::new(fid);
        let mut released = 0;
        while let Ok(pool_id) = cursor.next_in(self) {
            self.owners.set(usize::from(pool_id), &UNOWNED);
            released += 1;
        }
        if released > 0 {
            debug!(fid, released, "released pools owned by fid");
        }
        released
    }
}

impl fmt::Debug for PoolManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("max_pools", &self.max_pools)
            .field("pools_in_use", &self.pools_in_use())
            .field("pool_size_exp", &self.pool_size_get())
            .finish()
    }
}

/// Position of an in-progress search for the pools of one FID.
///
/// A fresh cursor starts at pool 0; [`OwnerCursor::next_in`] continues from
/// the last match and reports `NotFound` once the universe is exhausted.
/// It holds no borrow, so the manager can be changed between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerCursor {
    fid: Fid,
    next: u16,
}

impl OwnerCursor {
    pub fn new(fid: Fid) -> Self {
        Self { fid, next: 0 }
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn next_in(&mut self, manager: &PoolManager<'_>) -> Result<PoolId, AllocError> {
        while self.next < manager.max_pools {
            let pool_id = self.next;
            self.next += 1;
            if manager.owner(pool_id) == Some(self.fid) {
                return Ok(pool_id);
            }
        }
        Err(AllocError::NotFound)
    }
}

/// Iterator returned by [`PoolManager::find_pools_by_owner`].
pub struct OwnedPools<'m, 'a> {
    manager: &'m PoolManager<'a>,
    cursor: OwnerCursor,
}

impl Iterator for OwnedPools<'_, '_> {
    type Item = PoolId;

    fn next(&mut self) -> Option<PoolId> {
        self.cursor.next_in(self.manager).ok()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn backing(max_pools: u16) -> Vec<u8> {
        vec![0u8; PoolManager::size_query(max_pools).unwrap()]
    }

    #[test]
    fn test_size_query_bounds() {
        assert_eq!(PoolManager::size_query(1).unwrap(), 16 + 1 + 2);
        assert_eq!(PoolManager::size_query(1040).unwrap(), 16 + 130 + 2080);
        assert!(PoolManager::size_query(0).is_err());
        assert!(PoolManager::size_query(1041).is_err());
    }

    #[test]
    fn test_open_rejects_small_memory() {
        let mut memory = vec![0u8; 10];
        assert!(matches!(
            PoolManager::open(&mut memory, 4),
            Err(AllocError::MemoryTooSmall { .. })
        ));
    }

    #[test]
    fn test_first_fit_and_exhaustion() {
        let mut memory = backing(4);
        let mut manager = PoolManager::open(&mut memory, 4).unwrap();
        let ids: Vec<_> = (0..4).map(|_| manager.alloc().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(
            manager.alloc(),
            Err(AllocError::Exhausted {
                used: 4,
                all_used: true
            })
        );
        manager.free(1).unwrap();
        assert_eq!(manager.alloc().unwrap(), 1);
    }

    #[test]
    fn test_owned_pool_cannot_be_freed() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        let pool = manager.alloc().unwrap();
        manager.owner_add(pool, 7).unwrap();
        assert_eq!(
            manager.free(pool),
            Err(AllocError::PoolOwned {
                pool_id: pool,
                owner: 7
            })
        );
        manager.owner_remove(pool, 7).unwrap();
        manager.free(pool).unwrap();
        assert_eq!(manager.pools_in_use(), 0);
    }

    #[test]
    #[traced_test]
    fn test_rejections_are_logged() {
        let mut memory = backing(2);
        let mut manager = PoolManager::open(&mut memory, 2).unwrap();
        let pool = manager.alloc().unwrap();
        manager.owner_add(pool, 1).unwrap();
        assert!(manager.free(pool).is_err());
        assert!(logs_contain("freeing a pool that is still owned"));
        assert!(manager.owner_add(pool, 2).is_err());
        assert!(logs_contain("pool already has a different owner"));
    }

    #[test]
    fn test_free_unallocated() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        assert_eq!(manager.free(3), Err(AllocError::PoolNotAllocated(3)));
        assert!(matches!(manager.free(8), Err(AllocError::OutOfRange { .. })));
    }

    #[test]
    fn test_owner_add_rules() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        assert_eq!(manager.owner_add(0, 1), Err(AllocError::PoolNotAllocated(0)));
        let pool = manager.alloc().unwrap();
        manager.owner_add(pool, 1).unwrap();
        manager.owner_add(pool, 1).unwrap();
        assert_eq!(
            manager.owner_add(pool, 2),
            Err(AllocError::OwnerConflict {
                pool_id: pool,
                owner: 1
            })
        );
        assert!(matches!(
            manager.owner_add(pool, UNOWNED),
            Err(AllocError::OutOfRange { param: "fid", .. })
        ));
        assert_eq!(manager.find_owner(pool), Ok(1));
    }

    #[test]
    fn test_owner_remove_requires_exact_owner() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        let pool = manager.alloc().unwrap();
        assert_eq!(
            manager.owner_remove(pool, 1),
            Err(AllocError::OwnerMismatch { pool_id: pool, fid: 1 })
        );
        manager.owner_add(pool, 1).unwrap();
        assert!(manager.owner_remove(pool, 2).is_err());
        manager.owner_remove(pool, 1).unwrap();
        assert_eq!(manager.find_owner(pool), Err(AllocError::NotFound));
    }

    #[test]
    fn test_find_owner_not_found() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        assert_eq!(manager.find_owner(5), Err(AllocError::NotFound));
        let pool = manager.alloc().unwrap();
        assert_eq!(manager.find_owner(pool), Err(AllocError::NotFound));
    }

    #[test]
    fn test_search_by_owner() {
        let mut memory = backing(16);
        let mut manager = PoolManager::open(&mut memory, 16).unwrap();
        for _ in 0..10 {
            manager.alloc().unwrap();
        }
        for pool in [1, 4, 9] {
            manager.owner_add(pool, 3).unwrap();
        }
        manager.owner_add(2, 5).unwrap();

        assert_eq!(manager.find_pools_by_owner(3).collect::<Vec<_>>(), vec![1, 4, 9]);
        assert_eq!(manager.owned_count(5), 1);
        assert_eq!(manager.find_pools_by_owner(6).next(), None);

        // Two scans interleaved do not disturb each other.
        let mut a = manager.find_pools_by_owner(3);
        let mut b = manager.find_pools_by_owner(3);
        assert_eq!(a.next(), Some(1));
        assert_eq!(b.next(), Some(1));
        assert_eq!(a.next(), Some(4));
        assert_eq!(b.next(), Some(4));
    }

    #[test]
    fn test_cursor_allows_mutation_between_steps() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        for pool in 0..4 {
            manager.alloc().unwrap();
            manager.owner_add(pool, 9).unwrap();
        }
        let mut cursor = OwnerCursor::new(9);
        let mut removed = Vec::new();
        while let Ok(pool) = cursor.next_in(&manager) {
            manager.owner_remove(pool, 9).unwrap();
            manager.free(pool).unwrap();
            removed.push(pool);
        }
        assert_eq!(removed, vec![0, 1, 2, 3]);
        assert_eq!(cursor.next_in(&manager), Err(AllocError::NotFound));
        assert_eq!(manager.pools_in_use(), 0);
    }

    #[test]
    fn test_release_owner() {
        let mut memory = backing(8);
        let mut manager = PoolManager::open(&mut memory, 8).unwrap();
        for pool in 0..5 {
            manager.alloc().unwrap();
            manager.owner_add(pool, if pool % 2 == 0 { 1 } else { 2 }).unwrap();
        }
        assert_eq!(manager.release_owner(1), 3);
        assert_eq!(manager.owned_count(1), 0);
        assert_eq!(manager.owned_count(2), 2);
        assert_eq!(manager.pools_in_use(), 5);
        assert_eq!(manager.release_owner(1), 0);
    }

    #[test]
    fn test_pool_size_metadata() {
        let mut memory = backing(2);
        let mut manager = PoolManager::open(&mut memory, 2).unwrap();
        assert_eq!(manager.pool_size_get(), 0);
        manager.pool_size_set(12);
        assert_eq!(manager.pool_size_get(), 12);
    }

    #[test]
    fn test_attach_and_close() {
        let mut memory = backing(8);
        {
            let mut manager = PoolManager::open(&mut memory, 8).unwrap();
            let pool = manager.alloc().unwrap();
            manager.owner_add(pool, 4).unwrap();
            manager.pool_size_set(6);
        }
        let manager = PoolManager::attach(&mut memory).unwrap();
        assert_eq!(manager.find_owner(0), Ok(4));
        assert_eq!(manager.pool_size_get(), 6);
        assert_eq!(manager.pools_in_use(), 1);
        manager.close();
        assert!(memory.iter().all(|&b| b == 0));
        assert_eq!(
            PoolManager::attach(&mut memory).err(),
            Some(AllocError::BadSignature)
        );
    }
}
