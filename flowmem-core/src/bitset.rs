//! ## flowmem-core::bitset
//! **Bit array over borrowed bytes**
//!
//! Bit `i` lives in byte `i / 8` under mask `0x80 >> (i % 8)`, so the first
//! record of a block is the most significant bit of its byte.
//!
//! Range updates are all-or-nothing: every byte the range touches is checked
//! before any byte is written, so a conflicting update leaves the bitmap as
//! it was.

use crate::error::AllocError;

pub struct Bitset<'a> {
    bits: &'a mut [u8],
    len: u32,
}

/// `(byte index, mask)` pairs covering `[start, start + count)`.
fn byte_masks(start: u32, count: u32) -> impl Iterator<Item = (usize, u8)> {
    let end = start + count - 1;
    let (first, last) = (start / 8, end / 8);
    (first..=last).map(move |byte| {
        let lo = if byte == first { start % 8 } else { 0 };
        let hi = if byte == last { end % 8 } else { 7 };
        let mask = (0xFFu8 >> lo) & (0xFFu8 << (7 - hi));
        (byte as usize, mask)
    })
}

impl<'a> Bitset<'a> {
    /// Bytes needed to hold `len` bits.
    pub const fn bytes_for(len: u32) -> usize {
        (len as usize).div_ceil(8)
    }

    pub fn new(bits: &'a mut [u8], len: u32) -> Result<Self, AllocError> {
        let required = Self::bytes_for(len);
        if bits.len() < required {
            return Err(AllocError::MemoryTooSmall {
                provided: bits.len(),
                required,
            });
        }
        Ok(Self { bits, len })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gives the backing bytes back, e.g. to zero them.
    pub fn into_inner(self) -> &'a mut [u8] {
        self.bits
    }

    #[inline]
    fn bit(&self, index: u32) -> bool {
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    pub fn test(&self, index: u32) -> Result<bool, AllocError> {
        if index >= self.len {
            return Err(AllocError::out_of_range("bit index", index));
        }
        Ok(self.bit(index))
    }

    fn check_range(&self, start: u32, count: u32) -> Result<(), AllocError> {
        if count == 0 {
            return Err(AllocError::out_of_range("bit count", count));
        }
        match start.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(AllocError::out_of_range(
                "bit range end",
                u64::from(start) + u64::from(count),
            )),
        }
    }

    /// Sets `[start, start + count)`; fails without writing if any bit is already set.
    pub fn set_range(&mut self, start: u32, count: u32) -> Result<(), AllocError> {
        self.check_range(start, count)?;
        if byte_masks(start, count).any(|(byte, mask)| self.bits[byte] & mask != 0) {
            return Err(AllocError::AlreadyAllocated {
                offset: start,
                count,
            });
        }
        for (byte, mask) in byte_masks(start, count) {
            self.bits[byte] |= mask;
        }
        Ok(())
    }

    /// Clears `[start, start + count)`; fails without writing if any bit is already clear.
    pub fn clear_range(&mut self, start: u32, count: u32) -> Result<(), AllocError> {
        self.check_range(start, count)?;
        if byte_masks(start, count).any(|(byte, mask)| self.bits[byte] & mask != mask) {
            return Err(AllocError::NotAllocated {
                offset: start,
                count,
            });
        }
        for (byte, mask) in byte_masks(start, count) {
            self.bits[byte] &= !mask;
        }
        Ok(())
    }

    /// First clear bit in `[from, end)`, stepping over full bytes.
    pub fn next_clear(&self, from: u32, end: u32) -> Option<u32> {
        let end = end.min(self.len);
        let mut index = from;
        while index < end {
            let shift = index % 8;
            let byte = self.bits[(index / 8) as usize];
            // Vacated low bits read as set so they never match.
            let probe = (byte << shift) | ((1u16 << shift) - 1) as u8;
            let run = probe.leading_ones();
            if run < 8 {
                let found = index + run;
                return (found < end).then_some(found);
            }
            index = (index / 8 + 1) * 8;
        }
        None
    }

    /// Number of set bits in `[start, end)`.
    pub fn count_ones(&self, start: u32, end: u32) -> u32 {
        let end = end.min(self.len);
        if start >= end {
            return 0;
        }
        byte_masks(start, end - start)
            .map(|(byte, mask)| (self.bits[byte] & mask).count_ones())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order_is_msb_first() {
        let mut raw = [0u8; 2];
        let mut bits = Bitset::new(&mut raw, 16).unwrap();
        bits.set_range(0, 1).unwrap();
        bits.set_range(9, 1).unwrap();
        assert!(bits.test(0).unwrap());
        assert!(!bits.test(1).unwrap());
        assert!(bits.test(9).unwrap());
        assert_eq!(raw, [0x80, 0x40]);
    }

    #[test]
    fn test_set_range_within_one_byte() {
        let mut raw = [0u8; 1];
        let mut bits = Bitset::new(&mut raw, 8).unwrap();
        bits.set_range(2, 3).unwrap();
        assert_eq!(raw, [0b0011_1000]);
    }

    #[test]
    fn test_set_range_across_byte_boundaries() {
        let mut raw = [0u8; 3];
        let mut bits = Bitset::new(&mut raw, 24).unwrap();
        bits.set_range(6, 12).unwrap();
        assert_eq!(bits.count_ones(0, 24), 12);
        assert_eq!(raw, [0b0000_0011, 0xFF, 0b1100_0000]);
    }

    #[test]
    fn test_set_range_is_all_or_nothing() {
        let mut raw = [0u8; 2];
        let mut bits = Bitset::new(&mut raw, 16).unwrap();
        bits.set_range(10, 1).unwrap();
        let err = bits.set_range(4, 8).unwrap_err();
        assert_eq!(
            err,
            AllocError::AlreadyAllocated {
                offset: 4,
                count: 8
            }
        );
        assert_eq!(bits.count_ones(0, 16), 1);
        assert_eq!(raw, [0x00, 0x20]);
    }

    #[test]
    fn test_clear_range_is_all_or_nothing() {
        let mut raw = [0u8; 2];
        let mut bits = Bitset::new(&mut raw, 16).unwrap();
        bits.set_range(4, 4).unwrap();
        let err = bits.clear_range(4, 8).unwrap_err();
        assert_eq!(
            err,
            AllocError::NotAllocated {
                offset: 4,
                count: 8
            }
        );
        assert_eq!(bits.count_ones(0, 16), 4);
        bits.clear_range(4, 4).unwrap();
        assert_eq!(raw, [0, 0]);
    }

    #[test]
    fn test_range_bounds() {
        let mut raw = [0u8; 2];
        let mut bits = Bitset::new(&mut raw, 12).unwrap();
        assert!(matches!(
            bits.set_range(8, 5),
            Err(AllocError::OutOfRange { .. })
        ));
        assert!(matches!(
            bits.set_range(0, 0),
            Err(AllocError::OutOfRange { .. })
        ));
        assert!(matches!(bits.test(12), Err(AllocError::OutOfRange { .. })));
        bits.set_range(8, 4).unwrap();
    }

    #[test]
    fn test_next_clear_skips_full_bytes() {
        let mut raw = [0xFF, 0xFF, 0b1110_1111];
        let bits = Bitset::new(&mut raw, 24).unwrap();
        assert_eq!(bits.next_clear(0, 24), Some(19));
        assert_eq!(bits.next_clear(20, 24), None);
        assert_eq!(bits.next_clear(0, 19), None);
    }

    #[test]
    fn test_next_clear_starts_mid_byte() {
        let mut raw = [0b0101_0000];
        let bits = Bitset::new(&mut raw, 8).unwrap();
        assert_eq!(bits.next_clear(0, 8), Some(0));
        assert_eq!(bits.next_clear(1, 8), Some(2));
        assert_eq!(bits.next_clear(3, 8), Some(4));
    }

    #[test]
    fn test_next_clear_respects_len() {
        let mut raw = [0xFF, 0x00];
        let bits = Bitset::new(&mut raw, 10).unwrap();
        assert_eq!(bits.next_clear(0, 100), Some(8));
        let mut full = [0xFF, 0xC0];
        let bits = Bitset::new(&mut full, 10).unwrap();
        assert_eq!(bits.next_clear(0, 100), None);
    }

    #[test]
    fn test_new_rejects_short_backing() {
        let mut raw = [0u8; 1];
        assert_eq!(
            Bitset::new(&mut raw, 9).err(),
            Some(AllocError::MemoryTooSmall {
                provided: 1,
                required: 2
            })
        );
    }
}
