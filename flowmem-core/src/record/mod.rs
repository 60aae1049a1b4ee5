//! ## flowmem-core::record
//! **Contiguous record allocator**
//!
//! Hands out power-of-two groups of records (1 up to `max_contig_records`)
//! from a flat index space split into fixed-size blocks. A block is locked
//! to one size class on first use and returns to the untyped list once all
//! of its records are free again, so allocations of different sizes never
//! share a block and fragmentation stays inside a block.
//!
//! ### Region layout:
//! - header: signature, `max_records`, `records_in_use`, `records_per_block`, `max_contig_records`
//! - one list head per size class plus the untyped list
//! - one descriptor per block
//! - occupancy bitmap, one bit per record
//!
//! Within a size-class list, blocks with free records are kept ahead of
//! full ones: a block moves to the tail when it fills up and back to the
//! head when it first frees up again.

mod block;

use std::fmt;

use tracing::{debug, trace, warn};

use crate::bitset::Bitset;
use crate::error::{AllocError, InvariantViolation};
use crate::region::{read_u16, read_u32, stored_signature, write_u16, write_u32, Carver, Slot};
use block::{Block, BlockLists, ListHead, UNTYPED};

/// Largest `max_records` accepted.
pub const MAX_RECORDS: u32 = 64 * 1024 * 1024;
/// Largest `max_contig_records` accepted.
pub const MAX_CONTIG_RECORDS: u16 = 8;
pub const MIN_RECORDS_PER_BLOCK: u16 = 8;

const SIGNATURE: u32 = 0xF10A_11C8;
const HEADER_SIZE: usize = 16;

/// Size class of an allocation: class `k` groups `1 << (k - 1)` records.
/// Class 0 marks a block with nothing allocated and is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Class for a group of `records`, if `records` is a non-zero power of two.
    pub fn for_records(records: u16) -> Option<Self> {
        records
            .is_power_of_two()
            .then(|| SizeClass(records.trailing_zeros() as u8 + 1))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn records(self) -> u16 {
        1 << (self.0 - 1)
    }

    fn list(self) -> usize {
        usize::from(self.0)
    }
}

/// Result of a successful [`RecordAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First record of the group.
    pub offset: u32,
    pub records: u16,
    /// Records in use after this allocation.
    pub used: u32,
    pub all_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used: u32,
    pub max: u32,
    pub all_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    max_records: u32,
    max_contig_records: u16,
    records_per_block: u16,
    num_blocks: u32,
    num_lists: usize,
}

impl Geometry {
    fn new(max_records: u32, max_contig_records: u16) -> Result<Self, AllocError> {
        if !(1..=MAX_CONTIG_RECORDS).contains(&max_contig_records)
            || !max_contig_records.is_power_of_two()
        {
            return Err(AllocError::out_of_range(
                "max_contig_records",
                max_contig_records,
            ));
        }
        let max_records = max_records
            .checked_next_multiple_of(u32::from(max_contig_records))
            .filter(|aligned| (1..=MAX_RECORDS).contains(aligned))
            .ok_or_else(|| AllocError::out_of_range("max_records", max_records))?;
        let records_per_block = MIN_RECORDS_PER_BLOCK.max(max_contig_records);

        Ok(Self {
            max_records,
            max_contig_records,
            records_per_block,
            num_blocks: max_records.div_ceil(u32::from(records_per_block)),
            num_lists: max_contig_records.trailing_zeros() as usize + 2,
        })
    }

    fn bitmap_bits(&self) -> u32 {
        self.num_blocks * u32::from(self.records_per_block)
    }

    fn db_size(&self) -> usize {
        HEADER_SIZE
            + self.num_lists * ListHead::SIZE
            + self.num_blocks as usize * Block::SIZE
            + Bitset::bytes_for(self.bitmap_bits())
    }

    /// Usable records in `block`; only the last block can be short.
    fn capacity(&self, block: u32) -> u16 {
        let start = block * u32::from(self.records_per_block);
        (self.max_records - start).min(u32::from(self.records_per_block)) as u16
    }
}

/// Record allocator bound to a caller-supplied region.
pub struct RecordAllocator<'a> {
    header: &'a mut [u8],
    lists: BlockLists<'a>,
    bitmap: Bitset<'a>,
    spare: &'a mut [u8],
    geometry: Geometry,
}

impl<'a> RecordAllocator<'a> {
    /// Bytes of backing memory needed for the given configuration.
    pub fn size_query(max_records: u32, max_contig_records: u16) -> Result<usize, AllocError> {
        Geometry::new(max_records, max_contig_records).map(|g| g.db_size())
    }

    /// Initialises `memory` as an empty allocator.
    ///
    /// `max_records` is rounded up to a multiple of `max_contig_records`.
    pub fn open(
        memory: &'a mut [u8],
        max_records: u32,
        max_contig_records: u16,
    ) -> Result<Self, AllocError> {
        let geometry = Geometry::new(max_records, max_contig_records).inspect_err(|err| {
            warn!(max_records, max_contig_records, %err, "rejecting record allocator config");
        })?;
        let required = geometry.db_size();
        if memory.len() < required {
            warn!(provided = memory.len(), required, "record allocator memory too small");
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }

        memory.fill(0);
        let mut allocator = Self::carve(memory, geometry)?;
        write_u32(allocator.header, 0, SIGNATURE);
        write_u32(allocator.header, 4, geometry.max_records);
        write_u32(allocator.header, 8, 0);
        write_u16(allocator.header, 12, geometry.records_per_block);
        write_u16(allocator.header, 14, geometry.max_contig_records);
        allocator.lists.reset(|block| geometry.capacity(block));

        debug!(
            max_records = geometry.max_records,
            max_contig_records,
            blocks = geometry.num_blocks,
            bytes = required,
            "record allocator opened"
        );
        Ok(allocator)
    }

    /// Binds to a region initialised earlier by [`RecordAllocator::open`],
    /// e.g. one mapped from shared memory. Links and block descriptors are
    /// bounds-checked; bitmap contents are taken as found.
    pub fn attach(memory: &'a mut [u8]) -> Result<Self, AllocError> {
        if memory.len() < HEADER_SIZE || stored_signature(memory) != Some(SIGNATURE) {
            return Err(AllocError::BadSignature);
        }
        let geometry = Geometry::new(read_u32(memory, 4), read_u16(memory, 14))?;
        if read_u16(memory, 12) != geometry.records_per_block {
            return Err(AllocError::BadSignature);
        }
        let required = geometry.db_size();
        if memory.len() < required {
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }
        let allocator = Self::carve(memory, geometry)?;
        allocator.check_links()?;
        Ok(allocator)
    }

    /// Every stored link must name a block and every descriptor must fit
    /// its block; anything else is reported as `BadSignature`.
    fn check_links(&self) -> Result<(), AllocError> {
        let geometry = &self.geometry;
        let in_range = |link: Option<u32>| link.map_or(true, |index| index < geometry.num_blocks);
        if self.records_in_use() > geometry.max_records {
            warn!(records_in_use = self.records_in_use(), "attached record count exceeds capacity");
            return Err(AllocError::BadSignature);
        }
        for list in 0..self.lists.num_lists() {
            let head = self.lists.head(list);
            if !in_range(head.first) || !in_range(head.last) {
                warn!(list, "attached list head points outside the block table");
                return Err(AllocError::BadSignature);
            }
        }
        for index in 0..geometry.num_blocks {
            let block = self.lists.block(index);
            let capacity = geometry.capacity(index);
            let class_ok = block.contig_records == 0
                || (block.contig_records.is_power_of_two()
                    && block.contig_records <= geometry.max_contig_records);
            if !in_range(block.prev)
                || !in_range(block.next)
                || !class_ok
                || block.free_records > capacity
                || (block.free_records > 0 && block.first_free >= capacity)
            {
                warn!(block = index, "attached block descriptor is corrupt");
                return Err(AllocError::BadSignature);
            }
        }
        Ok(())
    }

    fn carve(memory: &'a mut [u8], geometry: Geometry) -> Result<Self, AllocError> {
        let mut carver = Carver::new(memory);
        let header = carver.bytes(HEADER_SIZE);
        let heads = carver.table(geometry.num_lists);
        let blocks = carver.table(geometry.num_blocks as usize);
        let bitmap_bytes = Bitset::bytes_for(geometry.bitmap_bits());
        let bitmap = Bitset::new(carver.bytes(bitmap_bytes), geometry.bitmap_bits())?;
        Ok(Self {
            header,
            lists: BlockLists::new(heads, blocks),
            bitmap,
            spare: carver.finish(),
            geometry,
        })
    }

    /// Zeroes the backing memory and releases it.
    pub fn close(self) {
        let Self {
            header,
            mut lists,
            bitmap,
            spare,
            ..
        } = self;
        header.fill(0);
        lists.wipe();
        bitmap.into_inner().fill(0);
        spare.fill(0);
        debug!("record allocator closed");
    }

    pub fn max_records(&self) -> u32 {
        self.geometry.max_records
    }

    pub fn max_contig_records(&self) -> u16 {
        self.geometry.max_contig_records
    }

    pub fn records_per_block(&self) -> u16 {
        self.geometry.records_per_block
    }

    pub fn num_blocks(&self) -> u32 {
        self.geometry.num_blocks
    }

    pub fn records_in_use(&self) -> u32 {
        debug_assert_eq!(read_u32(self.header, 0), SIGNATURE);
        read_u32(self.header, 8)
    }

    fn set_records_in_use(&mut self, used: u32) {
        write_u32(self.header, 8, used);
    }

    pub fn usage(&self) -> Usage {
        let used = self.records_in_use();
        Usage {
            used,
            max: self.geometry.max_records,
            all_used: used >= self.geometry.max_records,
        }
    }

    fn exhausted(&self) -> AllocError {
        let usage = self.usage();
        AllocError::Exhausted {
            used: usage.used,
            all_used: usage.all_used,
        }
    }

    fn size_class(&self, num_records: u16) -> Result<SizeClass, AllocError> {
        SizeClass::for_records(num_records)
            .filter(|_| num_records <= self.geometry.max_contig_records)
            .ok_or_else(|| {
                warn!(num_records, "invalid contiguous record count");
                AllocError::out_of_range("num_records", num_records)
            })
    }

    /// Takes a block off the untyped list and locks it to `class`.
    fn claim_block(&mut self, class: SizeClass) -> Result<u32, AllocError> {
        let Some(index) = self.lists.pop_front(UNTYPED) else {
            warn!("out of record blocks");
            return Err(self.exhausted());
        };
        self.lists
            .update_block(index, |b| b.contig_records = class.records());
        self.lists.push_front(class.list(), index);
        trace!(block = index, records = class.records(), "block locked to size class");
        Ok(index)
    }

    /// Unlocks `index` from `list` and returns it, fully free, to the untyped list.
    fn release_block(&mut self, list: usize, index: u32) {
        let capacity = self.geometry.capacity(index);
        self.lists.unlink(list, index);
        self.lists.update_block(index, |b| {
            b.free_records = capacity;
            b.first_free = 0;
            b.contig_records = 0;
        });
        self.lists.push_front(UNTYPED, index);
        trace!(block = index, "block returned to untyped list");
    }

    /// Allocates `num_records` contiguous records.
    ///
    /// `num_records` must be a power of two no larger than
    /// `max_contig_records`. On exhaustion the error still reports usage.
    pub fn alloc(&mut self, num_records: u16) -> Result<Allocation, AllocError> {
        let class = self.size_class(num_records)?;
        let list = class.list();
        let count = u32::from(num_records);
        let used = self.records_in_use();
        if used + count > self.geometry.max_records {
            warn!(num_records, used, "requested records not available");
            return Err(self.exhausted());
        }

        let mut claimed = None;
        let mut index = match self.lists.head(list).first {
            Some(first) => first,
            None => {
                let fresh = self.claim_block(class)?;
                claimed = Some(fresh);
                fresh
            }
        };
        // Non-full blocks precede full ones, so the first full block (or the
        // end of the list) means a fresh block is needed. A fresh block always
        // fits, so this claims at most once.
        loop {
            let block = self.lists.block(index);
            if block.free_records >= num_records {
                break;
            }
            index = match block.next {
                Some(next) if block.free_records != 0 => next,
                _ => {
                    let fresh = self.claim_block(class)?;
                    claimed = Some(fresh);
                    fresh
                }
            };
        }

        let rpb = self.geometry.records_per_block;
        let base = index * u32::from(rpb);
        let block = self.lists.block(index);
        let offset = base + u32::from(block.first_free);
        if let Err(err) = self.bitmap.set_range(offset, count) {
            warn!(offset, num_records, "records are already allocated");
            if let Some(fresh) = claimed {
                self.release_block(list, fresh);
            }
            return Err(err);
        }

        let free_records = block.free_records - num_records;
        let first_free = if free_records == 0 {
            self.lists.unlink(list, index);
            self.lists.push_back(list, index);
            rpb
        } else {
            self.bitmap
                .next_clear(offset + count, base + u32::from(rpb))
                .map_or(rpb, |next| (next - base) as u16)
        };
        self.lists.update_block(index, |b| {
            b.free_records = free_records;
            b.first_free = first_free;
        });

        let used = used + count;
        self.set_records_in_use(used);
        Ok(Allocation {
            offset,
            records: num_records,
            used,
            all_used: used >= self.geometry.max_records,
        })
    }

    /// Frees a group previously returned by [`RecordAllocator::alloc`] and
    /// returns the records still in use.
    pub fn free(&mut self, offset: u32, num_records: u16) -> Result<u32, AllocError> {
        if offset >= self.geometry.max_records {
            warn!(offset, "record offset out of range");
            return Err(AllocError::out_of_range("record offset", offset));
        }
        let class = self.size_class(num_records)?;
        let count = u32::from(num_records);
        if offset % count != 0 {
            warn!(offset, num_records, "record offset not aligned to its size class");
            return Err(AllocError::out_of_range("record offset", offset));
        }
        let list = class.list();
        if self.lists.head(list).first.is_none() {
            warn!(offset, num_records, "records were not allocated");
            return Err(AllocError::NotAllocated { offset, count });
        }

        let rpb = u32::from(self.geometry.records_per_block);
        let index = offset / rpb;
        let record = (offset % rpb) as u16;
        let block = self.lists.block(index);
        if block.contig_records != num_records {
            warn!(
                requested = num_records,
                locked = block.contig_records,
                "size class does not match the allocation"
            );
            return Err(AllocError::SizeClassMismatch {
                requested: num_records,
                locked: block.contig_records,
            });
        }
        self.bitmap.clear_range(offset, count).inspect_err(|_| {
            warn!(offset, num_records, "records are not allocated");
        })?;

        let free_records = block.free_records + num_records;
        if free_records >= self.geometry.capacity(index) {
            self.release_block(list, index);
        } else if free_records == num_records {
            // Was full: back to the front where the search starts.
            self.lists.unlink(list, index);
            self.lists.push_front(list, index);
            self.lists.update_block(index, |b| {
                b.free_records = free_records;
                b.first_free = record;
            });
        } else {
            self.lists.update_block(index, |b| {
                b.free_records = free_records;
                b.first_free = b.first_free.min(record);
            });
        }

        let used = self.records_in_use() - count;
        self.set_records_in_use(used);
        Ok(used)
    }

    /// Size class of the allocation covering `record`.
    pub fn entry_size_get(&self, record: u32) -> Result<SizeClass, AllocError> {
        if record >= self.geometry.max_records {
            return Err(AllocError::out_of_range("record index", record));
        }
        let block = self
            .lists
            .block(record / u32::from(self.geometry.records_per_block));
        if block.contig_records == 0 || !self.bitmap.test(record)? {
            return Err(AllocError::NotFound);
        }
        SizeClass::for_records(block.contig_records).ok_or(AllocError::NotFound)
    }

    /// Audits the whole structure: bitmap against counters, list linkage,
    /// free-hint accuracy and the non-full-before-full ordering.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let geometry = &self.geometry;
        let rpb = u32::from(geometry.records_per_block);
        let violation = |msg: String| Err(InvariantViolation(msg));

        let mut allocated = 0;
        for index in 0..geometry.num_blocks {
            let block = self.lists.block(index);
            let base = index * rpb;
            let capacity = geometry.capacity(index);
            let ones = self.bitmap.count_ones(base, base + u32::from(capacity));
            if ones + u32::from(block.free_records) != u32::from(capacity) {
                return violation(format!(
                    "block {index}: {ones} records set but {} free of {capacity}",
                    block.free_records
                ));
            }
            if self.bitmap.count_ones(base + u32::from(capacity), base + rpb) != 0 {
                return violation(format!("block {index}: records set past capacity"));
            }
            if block.free_records > 0 {
                let lowest = self.bitmap.next_clear(base, base + u32::from(capacity));
                if lowest != Some(base + u32::from(block.first_free)) {
                    return violation(format!(
                        "block {index}: free hint {} but lowest free is {lowest:?}",
                        block.first_free
                    ));
                }
            }
            allocated += ones;
        }
        if allocated != self.records_in_use() {
            return violation(format!(
                "{allocated} records set but {} in use",
                self.records_in_use()
            ));
        }

        let mut listed = 0u32;
        for list in 0..self.lists.num_lists() {
            let records = if list == UNTYPED { 0 } else { 1u16 << (list - 1) };
            let mut prev = None;
            let mut seen_full = false;
            for index in self.lists.iter(list) {
                let block = self.lists.block(index);
                listed += 1;
                if listed > geometry.num_blocks {
                    return violation(format!("list {list} is cyclic"));
                }
                if block.prev != prev {
                    return violation(format!("list {list}: block {index} has a stale back link"));
                }
                if block.contig_records != records {
                    return violation(format!(
                        "list {list}: block {index} locked to {} records",
                        block.contig_records
                    ));
                }
                if list == UNTYPED && block.free_records != geometry.capacity(index) {
                    return violation(format!("untyped block {index} is not fully free"));
                }
                if block.free_records == 0 {
                    seen_full = true;
                } else if seen_full {
                    return violation(format!(
                        "list {list}: block {index} has free records behind a full block"
                    ));
                }
                prev = Some(index);
            }
            if self.lists.head(list).last != prev {
                return violation(format!("list {list}: tail does not match last block"));
            }
        }
        if listed != geometry.num_blocks {
            return violation(format!(
                "{listed} blocks on lists, {} expected",
                geometry.num_blocks
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RecordAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordAllocator")
            .field("max_records", &self.geometry.max_records)
            .field("max_contig_records", &self.geometry.max_contig_records)
            .field("records_per_block", &self.geometry.records_per_block)
            .field("records_in_use", &self.records_in_use())
            .finish()
    }
}
