//! Touching user memory from the kernel.

use super::address_space::{AddressSpace, LoadError};
use super::page_table::SupplementalPageTable;
use crate::interrupts::page_fault::InterruptFrame;
use crate::threading::process::Process;
use alloc::vec::Vec;
use kidneyos_shared::mem::{is_user_vaddr, pages_spanned};

/// Where a checked read resumes when the resolver gives up on its access.
const USER_READ_RESUME: usize = 0xC010_0000;

/// Keeps every page of a user buffer resident while the kernel does I/O on
/// it. Pages are pinned before they are loaded, so the evictor can never take
/// one between the two steps. Dropping the guard unpins them, on every path.
pub struct PinGuard<'a> {
    spt: &'a SupplementalPageTable,
    pages: Vec<usize>,
}

impl<'a> PinGuard<'a> {
    /// Pins and loads every page of `[start, start + len)`.
    ///
    /// Fails if a page has no entry; pages pinned so far are released again.
    /// The pool must have a frame for each page, or this waits forever.
    pub fn new(space: &'a AddressSpace, start: usize, len: usize) -> Result<Self, LoadError> {
        let mut guard = Self {
            spt: space.spt(),
            pages: Vec::new(),
        };
        for upage in pages_spanned(start, len) {
            space.spt().pin(upage).map_err(|_| LoadError::NoEntry)?;
            guard.pages.push(upage);
            space.load_page(upage)?;
        }
        Ok(guard)
    }

    pub fn pages(&self) -> &[usize] {
        &self.pages
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        for &upage in &self.pages {
            // The entry can only be gone if the process is being torn down.
            let _ = self.spt.unpin(upage);
        }
    }
}

/// Reads the user byte at `addr`, or returns `None` if it is not readable.
///
/// The read is done in kernel mode with an access record in place, so a
/// fault that cannot be resolved sends the read to its failure path instead
/// of taking the kernel down.
pub fn get_user(process: &Process, addr: usize) -> Option<u8> {
    if !is_user_vaddr(addr) {
        return None;
    }
    let _access = process.begin_user_access(addr);
    let mut intr = InterruptFrame {
        eip: 0,
        eax: USER_READ_RESUME,
        esp: 0,
    };
    process.access_byte(addr, None, false, &mut intr).ok()
}
