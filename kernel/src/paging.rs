//! Per-process page directory.
//!
//! The directory is a flat map from virtual page number to hardware
//! [`PageTableEntry`]. User accesses go through [`PageManager::access`],
//! which does what the MMU would: it checks presence and write permission
//! and sets the accessed and dirty bits.

use crate::sync::mutex::Mutex;
use hashbrown::HashMap;
use kidneyos_shared::paging::{page_number, PageTableEntry};

/// Why an access did not translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    NotPresent,
    /// Write to a read-only page.
    Protection,
}

#[derive(Default)]
pub struct PageManager {
    entries: Mutex<HashMap<usize, PageTableEntry>>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `upage` to frame number `frame`, replacing any previous mapping.
    /// Accessed and dirty start cleared.
    pub fn map(&self, upage: usize, frame: usize, writable: bool) {
        self.entries
            .lock()
            .insert(page_number(upage), PageTableEntry::user_page(frame, writable));
    }

    /// Removes the mapping for `upage`, returning the last hardware entry so
    /// the caller can inspect its dirty bit.
    pub fn unmap(&self, upage: usize) -> Option<PageTableEntry> {
        self.entries.lock().remove(&page_number(upage))
    }

    pub fn lookup(&self, upage: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&page_number(upage)).copied()
    }

    pub fn is_mapped(&self, upage: usize) -> bool {
        self.entries.lock().contains_key(&page_number(upage))
    }

    pub fn is_dirty(&self, upage: usize) -> bool {
        self.lookup(upage).is_some_and(|pte| pte.dirty())
    }

    pub fn set_dirty(&self, upage: usize, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&page_number(upage)) {
            *pte = pte.with_dirty(dirty);
        }
    }

    /// Returns the accessed bit of `upage` and clears it.
    pub fn take_accessed(&self, upage: usize) -> bool {
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&page_number(upage)) else {
            return false;
        };
        let accessed = pte.accessed();
        *pte = pte.with_accessed(false);
        accessed
    }

    /// Translates `vaddr` and runs `f` with the frame number while the
    /// directory stays locked, so the mapping cannot be torn down under it.
    pub fn access<R>(
        &self,
        vaddr: usize,
        write: bool,
        f: impl FnOnce(usize) -> R,
    ) -> Result<R, AccessFault> {
        let mut entries = self.entries.lock();
        let pte = entries
            .get_mut(&page_number(vaddr))
            .ok_or(AccessFault::NotPresent)?;
        if write && !pte.read_write() {
            return Err(AccessFault::Protection);
        }
        *pte = pte.with_accessed(true);
        if write {
            *pte = pte.with_dirty(true);
        }
        let frame = pte.frame();
        Ok(f(frame))
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}
