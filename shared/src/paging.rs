// https://wiki.osdev.org/Paging

// Frame numbers fit in 20 bits on a 32-bit machine with 4KB pages, which is
// all we support.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::u20;
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of frame number `frame`.
    pub fn user_page(frame: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame as u32))
    }

    /// The frame number this entry points at.
    pub fn frame(&self) -> usize {
        self.page_frame_address().value() as usize
    }
}

/// Virtual page number of `addr`, the key of a flat page map.
#[inline]
pub const fn page_number(addr: usize) -> usize {
    addr / PAGE_FRAME_SIZE
}
