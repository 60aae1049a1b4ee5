//! Block descriptors and the doubly linked block lists threaded through them.
//!
//! Lists are index based: each block stores the index of its neighbours and
//! each list head stores its first and last block. List 0 holds untyped
//! (fully free) blocks; list `k` holds blocks locked to size class `k`.

use crate::region::{read_link, read_u16, write_link, write_u16, Slot, Table};

pub(crate) const UNTYPED: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub free_records: u16,
    /// Lowest free record offset within the block.
    pub first_free: u16,
    /// Records per allocation in this block; 0 while untyped.
    pub contig_records: u16,
}

impl Slot for Block {
    const SIZE: usize = 16;

    fn decode(raw: &[u8]) -> Self {
        Self {
            prev: read_link(raw, 0),
            next: read_link(raw, 4),
            free_records: read_u16(raw, 8),
            first_free: read_u16(raw, 10),
            contig_records: read_u16(raw, 12),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        write_link(raw, 0, self.prev);
        write_link(raw, 4, self.next);
        write_u16(raw, 8, self.free_records);
        write_u16(raw, 10, self.first_free);
        write_u16(raw, 12, self.contig_records);
        write_u16(raw, 14, 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub first: Option<u32>,
    pub last: Option<u32>,
}

impl ListHead {
    const EMPTY: ListHead = ListHead {
        first: None,
        last: None,
    };
}

impl Slot for ListHead {
    const SIZE: usize = 8;

    fn decode(raw: &[u8]) -> Self {
        Self {
            first: read_link(raw, 0),
            last: read_link(raw, 4),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        write_link(raw, 0, self.first);
        write_link(raw, 4, self.last);
    }
}

pub(crate) struct BlockLists<'a> {
    heads: Table<'a, ListHead>,
    blocks: Table<'a, Block>,
}

impl<'a> BlockLists<'a> {
    pub(crate) fn new(heads: Table<'a, ListHead>, blocks: Table<'a, Block>) -> Self {
        Self { heads, blocks }
    }

    pub(crate) fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub(crate) fn num_lists(&self) -> usize {
        self.heads.len()
    }

    /// Chains every block, in index order, onto the untyped list and empties
    /// all size-class lists.
    pub(crate) fn reset(&mut self, capacity_of: impl Fn(u32) -> u16) {
        for list in 0..self.heads.len() {
            self.heads.set(list, &ListHead::EMPTY);
        }
        let count = self.num_blocks();
        for index in 0..count {
            let block = Block {
                prev: index.checked_sub(1),
                next: (index + 1 < count).then_some(index + 1),
                free_records: capacity_of(index),
                first_free: 0,
                contig_records: 0,
            };
            self.blocks.set(index as usize, &block);
        }
        if count > 0 {
            self.heads.set(
                UNTYPED,
                &ListHead {
                    first: Some(0),
                    last: Some(count - 1),
                },
            );
        }
    }

    #[inline]
    pub(crate) fn block(&self, index: u32) -> Block {
        self.blocks.get(index as usize)
    }

    #[inline]
    pub(crate) fn update_block<R>(&mut self, index: u32, f: impl FnOnce(&mut Block) -> R) -> R {
        self.blocks.update(index as usize, f)
    }

    #[inline]
    pub(crate) fn head(&self, list: usize) -> ListHead {
        self.heads.get(list)
    }

    pub(crate) fn push_front(&mut self, list: usize, index: u32) {
        let mut head = self.heads.get(list);
        self.update_block(index, |b| {
            b.prev = None;
            b.next = head.first;
        });
        match head.first {
            Some(first) => self.update_block(first, |b| b.prev = Some(index)),
            None => head.last = Some(index),
        }
        head.first = Some(index);
        self.heads.set(list, &head);
    }

    pub(crate) fn push_back(&mut self, list: usize, index: u32) {
        let mut head = self.heads.get(list);
        self.update_block(index, |b| {
            b.prev = head.last;
            b.next = None;
        });
        match head.last {
            Some(last) => self.update_block(last, |b| b.next = Some(index)),
            None => head.first = Some(index),
        }
        head.last = Some(index);
        self.heads.set(list, &head);
    }

    /// Removes `index` from `list`; the block must currently be on it.
    pub(crate) fn unlink(&mut self, list: usize, index: u32) {
        let mut head = self.heads.get(list);
        let block = self.block(index);
        match block.prev {
            Some(prev) => self.update_block(prev, |b| b.next = block.next),
            None => head.first = block.next,
        }
        match block.next {
            Some(next) => self.update_block(next, |b| b.prev = block.prev),
            None => head.last = block.prev,
        }
        self.update_block(index, |b| {
            b.prev = None;
            b.next = None;
        });
        self.heads.set(list, &head);
    }

    pub(crate) fn pop_front(&mut self, list: usize) -> Option<u32> {
        let first = self.heads.get(list).first?;
        self.unlink(list, first);
        Some(first)
    }

    /// Walks `list` from the head. Stops after `num_blocks + 1` steps so a
    /// corrupted cycle still terminates.
    pub(crate) fn iter(&self, list: usize) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(self.heads.get(list).first, move |&index| {
            self.block(index).next
        })
        .take(self.blocks.len() + 1)
    }

    pub(crate) fn wipe(&mut self) {
        self.heads.wipe();
        self.blocks.wipe();
    }
}
