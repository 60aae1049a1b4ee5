//! Typed views over a caller-supplied byte region.
//!
//! Instances never own memory. `open`/`attach` split the region into
//! consecutive sub-slices with a [`Carver`] and wrap each one in a
//! [`Table`] of fixed-width little-endian slots, so the layout is position
//! independent and identical no matter where the region is mapped.

use std::marker::PhantomData;

/// In-memory encoding of an absent block link.
pub(crate) const NO_LINK: u32 = u32::MAX;

/// A fixed-width value stored little-endian inside a region.
pub(crate) trait Slot: Sized {
    const SIZE: usize;

    fn decode(raw: &[u8]) -> Self;
    fn encode(&self, raw: &mut [u8]);
}

impl Slot for u16 {
    const SIZE: usize = 2;

    fn decode(raw: &[u8]) -> Self {
        read_u16(raw, 0)
    }

    fn encode(&self, raw: &mut [u8]) {
        write_u16(raw, 0, *self);
    }
}

impl Slot for u64 {
    const SIZE: usize = 8;

    fn decode(raw: &[u8]) -> Self {
        u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[..8].copy_from_slice(&self.to_le_bytes());
    }
}

#[inline]
pub(crate) fn read_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

#[inline]
pub(crate) fn write_u16(raw: &mut [u8], at: usize, value: u16) {
    raw[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

#[inline]
pub(crate) fn write_u32(raw: &mut [u8], at: usize, value: u32) {
    raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn read_link(raw: &[u8], at: usize) -> Option<u32> {
    match read_u32(raw, at) {
        NO_LINK => None,
        index => Some(index),
    }
}

#[inline]
pub(crate) fn write_link(raw: &mut [u8], at: usize, link: Option<u32>) {
    write_u32(raw, at, link.unwrap_or(NO_LINK));
}

/// Signature stored in the first four bytes of every instance region.
pub(crate) fn stored_signature(memory: &[u8]) -> Option<u32> {
    (memory.len() >= 4).then(|| read_u32(memory, 0))
}

/// Splits a region front to back into sub-slices.
///
/// Callers size-check the region first; carving past the end panics.
pub(crate) struct Carver<'a> {
    rest: &'a mut [u8],
}

impl<'a> Carver<'a> {
    pub(crate) fn new(memory: &'a mut [u8]) -> Self {
        Self { rest: memory }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> &'a mut [u8] {
        let rest = std::mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(len);
        self.rest = tail;
        head
    }

    pub(crate) fn table<T: Slot>(&mut self, len: usize) -> Table<'a, T> {
        Table::new(self.bytes(len * T::SIZE))
    }

    /// Whatever is left after the last carve.
    pub(crate) fn finish(self) -> &'a mut [u8] {
        self.rest
    }
}

/// An array of `T` slots backed by region bytes.
pub(crate) struct Table<'a, T> {
    raw: &'a mut [u8],
    _slot: PhantomData<T>,
}

impl<'a, T: Slot> Table<'a, T> {
    pub(crate) fn new(raw: &'a mut [u8]) -> Self {
        Self {
            raw,
            _slot: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.raw.len() / T::SIZE
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> T {
        let at = index * T::SIZE;
        T::decode(&self.raw[at..at + T::SIZE])
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize, value: &T) {
        let at = index * T::SIZE;
        value.encode(&mut self.raw[at..at + T::SIZE]);
    }

    /// Read-modify-write of one slot.
    #[inline]
    pub(crate) fn update<R>(&mut self, index: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.get(index);
        let out = f(&mut value);
        self.set(index, &value);
        out
    }

    pub(crate) fn wipe(&mut self) {
        self.raw.fill(0);
    }
}
