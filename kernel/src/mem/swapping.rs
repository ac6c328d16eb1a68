//! Swap store: a slot allocator over the swap block device.
//!
//! Slot `i` occupies sectors `[i * SECTORS_PER_SLOT, (i + 1) * SECTORS_PER_SLOT)`.
//! There is no header on the device; the slot index is the only addressing.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{error, trace};

pub const SECTORS_PER_SLOT: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_SLOT) as BlockSector
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

pub struct SwapStore {
    device: Block,
    /// One bit per slot, set while the slot holds a page.
    used: Vec<u64>,
    slot_count: usize,
    in_use: usize,
}

impl SwapStore {
    pub fn new(device: Block) -> Self {
        let slot_count = device.get_size() as usize / SECTORS_PER_SLOT;
        Self {
            device,
            used: vec![0; slot_count.div_ceil(64)],
            slot_count,
            in_use: 0,
        }
    }

    /// Finds a free slot and marks it used.
    ///
    /// # Panics
    ///
    /// Panics when every slot is in use. There is nowhere else to put the page.
    pub fn allocate_slot(&mut self) -> SwapSlot {
        for (word_index, word) in self.used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let index = word_index * 64 + bit;
            if index >= self.slot_count {
                break;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            trace!("swap: allocated slot {index}");
            return SwapSlot(index);
        }

        error!(
            "swap exhausted: all {} slots of {} are in use",
            self.slot_count,
            self.device.get_name()
        );
        panic!("swap exhausted");
    }

    /// Returns `slot` to the free pool.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not currently allocated.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        let (word, mask) = Self::locate(slot);
        assert!(
            slot.0 < self.slot_count && self.used[word] & mask != 0,
            "double free of swap {slot}"
        );
        self.used[word] &= !mask;
        self.in_use -= 1;
        trace!("swap: freed {slot}");
    }

    /// Writes one page to `slot`.
    pub fn write(&mut self, slot: SwapSlot, page: &[u8]) -> Result<(), BlockError> {
        if page.len() != PAGE_FRAME_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let first = slot.first_sector();
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            self.device.write(first + i as BlockSector, sector)?;
        }
        Ok(())
    }

    /// Reads one page from `slot`. The slot stays allocated.
    pub fn read(&mut self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        if page.len() != PAGE_FRAME_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let first = slot.first_sector();
        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.device.read(first + i as BlockSector, sector)?;
        }
        Ok(())
    }

    pub fn slots_in_use(&self) -> usize {
        self.in_use
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn locate(slot: SwapSlot) -> (usize, u64) {
        (slot.0 / 64, 1 << (slot.0 % 64))
    }
}
