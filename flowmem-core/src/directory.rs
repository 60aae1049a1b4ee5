//! ## flowmem-core::directory
//! **Dense `(table scope, region, direction)` handle lookup**
//!
//! Slots are addressed directly:
//! `dir * max_regions * max_table_scopes + tsid * max_regions + region`.
//! Every triple inside the configured bounds owns exactly one slot, so there
//! is nothing to hash and nothing to resolve.

use std::fmt;
use std::num::NonZeroU64;

use tracing::{debug, warn};

use crate::error::AllocError;
use crate::region::{stored_signature, write_u32, Carver, Table};

const SIGNATURE: u32 = 0xF10A_D1C7;
const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx = 0,
    Tx = 1,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Rx, Direction::Tx];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// The two regions every table scope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionType {
    Lookup = 0,
    Action = 1,
}

impl RegionType {
    pub const ALL: [RegionType; 2] = [RegionType::Lookup, RegionType::Action];

    pub fn index(self) -> u8 {
        self as u8
    }
}

impl From<RegionType> for u8 {
    fn from(region: RegionType) -> u8 {
        region.index()
    }
}

/// Caller-chosen token stored in the directory, typically identifying a
/// pool manager instance. Zero is reserved for the empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(NonZeroU64);

impl InstanceHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// One populated slot of a table scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeEntry {
    pub region: u8,
    pub dir: Direction,
    pub handle: InstanceHandle,
}

pub struct InstanceDirectory<'a> {
    header: &'a mut [u8],
    slots: Table<'a, u64>,
    spare: &'a mut [u8],
    max_table_scopes: u8,
    max_regions: u8,
}

fn check_geometry(max_table_scopes: u8, max_regions: u8) -> Result<usize, AllocError> {
    if max_table_scopes == 0 {
        return Err(AllocError::out_of_range("max_table_scopes", max_table_scopes));
    }
    if max_regions == 0 {
        return Err(AllocError::out_of_range("max_regions", max_regions));
    }
    Ok(Direction::ALL.len() * usize::from(max_table_scopes) * usize::from(max_regions))
}

impl<'a> InstanceDirectory<'a> {
    pub fn size_query(max_table_scopes: u8, max_regions: u8) -> Result<usize, AllocError> {
        let slots = check_geometry(max_table_scopes, max_regions)?;
        Ok(HEADER_SIZE + slots * 8)
    }

    pub fn open(memory: &'a mut [u8], max_table_scopes: u8, max_regions: u8) -> Result<Self, AllocError> {
        let required = Self::size_query(max_table_scopes, max_regions)
            .inspect_err(|err| warn!(%err, "invalid directory geometry"))?;
        if memory.len() < required {
            warn!(provided = memory.len(), required, "directory memory too small");
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }
        memory.fill(0);
        let directory = Self::carve(memory, max_table_scopes, max_regions)?;
        write_u32(directory.header, 0, SIGNATURE);
        directory.header[4] = max_table_scopes;
        directory.header[5] = max_regions;
        debug!(max_table_scopes, max_regions, bytes = required, "instance directory opened");
        Ok(directory)
    }

    /// Binds to a region initialised earlier by [`InstanceDirectory::open`].
    pub fn attach(memory: &'a mut [u8]) -> Result<Self, AllocError> {
        if memory.len() < HEADER_SIZE || stored_signature(memory) != Some(SIGNATURE) {
            return Err(AllocError::BadSignature);
        }
        let (max_table_scopes, max_regions) = (memory[4], memory[5]);
        let required = Self::size_query(max_table_scopes, max_regions)?;
        if memory.len() < required {
            return Err(AllocError::MemoryTooSmall {
                provided: memory.len(),
                required,
            });
        }
        Self::carve(memory, max_table_scopes, max_regions)
    }

    fn carve(memory: &'a mut [u8], max_table_scopes: u8, max_regions: u8) -> Result<Self, AllocError> {
        let slots = check_geometry(max_table_scopes, max_regions)?;
        let mut carver = Carver::new(memory);
        let header = carver.bytes(HEADER_SIZE);
        let slots = carver.table(slots);
        Ok(Self {
            header,
            slots,
            spare: carver.finish(),
            max_table_scopes,
            max_regions,
        })
    }

    pub fn close(self) {
        let Self {
            header,
            mut slots,
            spare,
            ..
        } = self;
        header.fill(0);
        slots.wipe();
        spare.fill(0);
        debug!("instance directory closed");
    }

    pub fn max_table_scopes(&self) -> u8 {
        self.max_table_scopes
    }

    pub fn max_regions(&self) -> u8 {
        self.max_regions
    }

    fn slot_index(&self, tsid: u8, region: u8, dir: Direction) -> Result<usize, AllocError> {
        debug_assert_eq!(stored_signature(self.header), Some(SIGNATURE));
        if tsid >= self.max_table_scopes {
            warn!(tsid, max_table_scopes = self.max_table_scopes, "table scope out of range");
            return Err(AllocError::out_of_range("tsid", tsid));
        }
        if region >= self.max_regions {
            warn!(region, max_regions = self.max_regions, "region out of range");
            return Err(AllocError::out_of_range("region", region));
        }
        let (scopes, regions) = (usize::from(self.max_table_scopes), usize::from(self.max_regions));
        Ok(dir.index() * regions * scopes + usize::from(tsid) * regions + usize::from(region))
    }

    /// Overwrites the slot; `None` empties it.
    pub fn set(
        &mut self,
        tsid: u8,
        region: u8,
        dir: Direction,
        handle: Option<InstanceHandle>,
    ) -> Result<(), AllocError> {
        let index = self.slot_index(tsid, region, dir)?;
        self.slots.set(index, &handle.map_or(0, InstanceHandle::get));
        Ok(())
    }

    /// `Ok(None)` is an empty slot, not an error.
    pub fn get(&self, tsid: u8, region: u8, dir: Direction) -> Result<Option<InstanceHandle>, AllocError> {
        let index = self.slot_index(tsid, region, dir)?;
        Ok(InstanceHandle::new(self.slots.get(index)))
    }

    /// Populated slots of one table scope, direction-major.
    pub fn scope_entries(&self, tsid: u8) -> Result<ScopeEntries<'_, 'a>, AllocError> {
        if tsid >= self.max_table_scopes {
            warn!(tsid, max_table_scopes = self.max_table_scopes, "table scope out of range");
            return Err(AllocError::out_of_range("tsid", tsid));
        }
        Ok(ScopeEntries {
            directory: self,
            tsid,
            position: 0,
        })
    }

    /// Empties every slot of `tsid`, handing each populated one to
    /// `on_clear` first. Returns the number cleared.
    pub fn clear_scope(
        &mut self,
        tsid: u8,
        mut on_clear: impl FnMut(ScopeEntry),
    ) -> Result<usize, AllocError> {
        let mut cleared = 0;
        for dir in Direction::ALL {
            for region in 0..self.max_regions {
                let index = self.slot_index(tsid, region, dir)?;
                if let Some(handle) = InstanceHandle::new(self.slots.get(index)) {
                    on_clear(ScopeEntry { region, dir, handle });
                    self.slots.set(index, &0);
                    cleared += 1;
                }
            }
        }
        debug!(tsid, cleared, "table scope cleared");
        Ok(cleared)
    }
}

/// Iterator over the populated slots of one table scope.
pub struct ScopeEntries<'d, 'a> {
    directory: &'d InstanceDirectory<'a>,
    tsid: u8,
    position: usize,
}

impl Iterator for ScopeEntries<'_, '_> {
    type Item = ScopeEntry;

    fn next(&mut self) -> Option<ScopeEntry> {
        let regions = usize::from(self.directory.max_regions);
        while self.position < Direction::ALL.len() * regions {
            let dir = Direction::ALL[self.position / regions];
            let region = (self.position % regions) as u8;
            self.position += 1;
            if let Ok(Some(handle)) = self.directory.get(self.tsid, region, dir) {
                return Some(ScopeEntry { region, dir, handle });
            }
        }
        None
    }
}

impl fmt::Debug for InstanceDirectory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceDirectory")
            .field("max_table_scopes", &self.max_table_scopes)
            .field("max_regions", &self.max_regions)
            .finish()
    }
}
