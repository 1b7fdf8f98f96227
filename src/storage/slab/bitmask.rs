//! Validity bitmasks of segment buffers
//!
//! A buffer starts with `bitmask_count` little-endian `u64` words. Bit `i`
//! describes segment `i`: 1 means free, 0 means occupied. Bits past the
//! buffer's segment capacity are kept at 0 so scans never hand them out.

use crate::error::{Error, Result};

/// Bits tracked by one bitmask word
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Bytes of one bitmask word
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Masks keeping the low half of the candidate bits at each halving level
const BASE: [u64; 6] = [
    0x0000_0000_FFFF_FFFF,
    0x0000_0000_0000_FFFF,
    0x0000_0000_0000_00FF,
    0x0000_0000_0000_000F,
    0x0000_0000_0000_0003,
    0x0000_0000_0000_0001,
];

/// Width of the half discarded at each halving level
const SHIFT: [u32; 6] = [32, 16, 8, 4, 2, 1];

/// Position of the lowest set bit of a non-zero word
pub fn lowest_set_bit(mut entry: u64) -> u32 {
    debug_assert!(entry != 0);
    let mut position = 0;
    for (base, shift) in BASE.iter().zip(SHIFT) {
        if entry & base != 0 {
            entry &= base;
        } else {
            entry >>= shift;
            position += shift;
        }
    }
    position
}

/// Position of the highest set bit of a non-zero word
pub fn highest_set_bit(mut entry: u64) -> u32 {
    debug_assert!(entry != 0);
    let mut position = 0;
    for (base, shift) in BASE.iter().zip(SHIFT) {
        if entry & !base != 0 {
            entry >>= shift;
            position += shift;
        } else {
            entry &= base;
        }
    }
    position
}

/// Word-level view over the bitmask region of a buffer
pub struct ValidityMask<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> ValidityMask<B> {
    /// Wrap a bitmask region; its length must be a multiple of the word size
    pub fn new(bytes: B) -> Self {
        debug_assert_eq!(bytes.as_ref().len() % WORD_SIZE, 0);
        Self { bytes }
    }

    pub fn word_count(&self) -> usize {
        self.bytes.as_ref().len() / WORD_SIZE
    }

    pub fn word(&self, index: usize) -> u64 {
        let start = index * WORD_SIZE;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&self.bytes.as_ref()[start..start + WORD_SIZE]);
        u64::from_le_bytes(word)
    }

    pub fn is_free(&self, position: usize) -> bool {
        self.word(position / BITS_PER_WORD) & (1u64 << (position % BITS_PER_WORD)) != 0
    }

    /// One past the highest occupied position among the first `available` bits
    ///
    /// Used to trim a buffer to its live prefix when persisting it. Scans the
    /// words from the highest index down, skipping fully free words.
    pub fn highest_occupied_offset(&self, available: usize) -> Result<u32> {
        for index in (0..self.word_count()).rev() {
            let valid_bits = available
                .saturating_sub(index * BITS_PER_WORD)
                .min(BITS_PER_WORD);
            if valid_bits == 0 {
                continue;
            }

            // positions past the capacity count as free
            let mut entry = self.word(index);
            if valid_bits < BITS_PER_WORD {
                entry |= u64::MAX << valid_bits;
            }
            if entry == u64::MAX {
                continue;
            }

            let highest = highest_set_bit(!entry) as usize;
            let max_offset = index * BITS_PER_WORD + highest;
            debug_assert!(!self.is_free(max_offset));
            return Ok(max_offset as u32 + 1);
        }

        Err(Error::Internal("tried to serialize empty buffer".to_string()))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> ValidityMask<B> {
    fn set_word(&mut self, index: usize, word: u64) {
        let start = index * WORD_SIZE;
        self.bytes.as_mut()[start..start + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
    }

    pub fn set_free(&mut self, position: usize) {
        let index = position / BITS_PER_WORD;
        let word = self.word(index) | (1u64 << (position % BITS_PER_WORD));
        self.set_word(index, word);
    }

    pub fn set_occupied(&mut self, position: usize) {
        let index = position / BITS_PER_WORD;
        let word = self.word(index) & !(1u64 << (position % BITS_PER_WORD));
        self.set_word(index, word);
    }

    /// Mark the first `available` positions free and everything after occupied
    pub fn set_all_free(&mut self, available: usize) {
        for index in 0..self.word_count() {
            let valid_bits = available
                .saturating_sub(index * BITS_PER_WORD)
                .min(BITS_PER_WORD);
            let word = match valid_bits {
                0 => 0,
                BITS_PER_WORD => u64::MAX,
                bits => !(u64::MAX << bits),
            };
            self.set_word(index, word);
        }
    }

    /// Claim a free position and mark it occupied
    ///
    /// `hint` is the buffer's occupancy count: while a buffer fills up
    /// sequentially that slot is free and no scan is needed.
    pub fn find_free_bit(&mut self, hint: usize, available: usize) -> Result<u32> {
        if hint < available && self.is_free(hint) {
            self.set_occupied(hint);
            return Ok(hint as u32);
        }

        for index in 0..self.word_count() {
            let entry = self.word(index);
            if entry == 0 {
                continue;
            }

            let position = index * BITS_PER_WORD + lowest_set_bit(entry) as usize;
            debug_assert!(position < available);
            self.set_occupied(position);
            return Ok(position as u32);
        }

        Err(Error::Internal(
            "Invalid bitmask for FixedSizeAllocator".to_string(),
        ))
    }
}
