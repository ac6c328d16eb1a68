//! Supplemental page table.
//!
//! One per process, keyed by page-aligned user address. Each entry says where
//! the page's data lives right now: nowhere yet (zero page), in a frame, in a
//! swap slot, or in a file. The hardware page directory only ever holds
//! mappings for pages whose entry is [`PageStatus::OnFrame`].
//!
//! Every entry carries its own lock. The table lock only guards the map
//! itself, so the evictor can reach into an entry from another context
//! without touching the table.

use super::frame_allocator::{Frame, FrameAllocator};
use super::swapping::SwapSlot;
use crate::fs::FileHandle;
use crate::paging::PageManager;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{sync::Arc, vec::Vec};
use hashbrown::HashMap;
use kidneyos_shared::mem::{is_page_aligned, page_round_down};
use log::trace;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageTableError {
    #[error("page already has an entry")]
    AlreadyPresent,
    #[error("page has no entry")]
    NotPresent,
    #[error("page is in a frame")]
    Resident,
}

pub type Result<T> = core::result::Result<T, PageTableError>;

/// Where a page's data is. Only the location named by the variant is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Never written; reads as zeros.
    AllZero,
    OnFrame(Frame),
    OnSwap(SwapSlot),
    /// Contents are in [`PageState::backing`].
    FromFilesys,
}

/// The part of a file a page is loaded from.
#[derive(Debug, Clone)]
pub struct FileBacking {
    pub file: FileHandle,
    pub offset: u64,
    /// Bytes read from `offset`; the rest of the page is zero-filled.
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Dirty contents go back to the file (memory-mapped files). When false
    /// (executable segments) a dirtied page goes to swap instead.
    pub write_back: bool,
}

#[derive(Debug)]
pub struct PageState {
    pub status: PageStatus,
    /// Kept while resident so a file-backed page can be dropped or written
    /// back on eviction.
    pub backing: Option<FileBacking>,
    pub writable: bool,
    /// Written since it was last loaded.
    pub dirty: bool,
    /// Written at least once since it was installed. Sticky: decides whether
    /// an evicted page must be preserved in swap.
    pub modified: bool,
    pub pin_count: usize,
}

impl PageState {
    fn new(status: PageStatus, backing: Option<FileBacking>, writable: bool) -> Self {
        Self {
            status,
            backing,
            writable,
            dirty: false,
            modified: false,
            pin_count: 0,
        }
    }

    pub fn frame(&self) -> Option<Frame> {
        match self.status {
            PageStatus::OnFrame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame().is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    pub fn set_swap(&mut self, slot: SwapSlot) {
        self.status = PageStatus::OnSwap(slot);
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
        self.modified |= dirty;
    }
}

pub struct PageEntry {
    upage: usize,
    state: Mutex<PageState>,
}

impl PageEntry {
    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }
}

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: Mutex<HashMap<usize, Arc<PageEntry>>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, upage: usize, state: PageState) -> Result<Arc<PageEntry>> {
        debug_assert!(is_page_aligned(upage), "unaligned page {upage:#x}");
        let mut pages = self.pages.lock();
        if pages.contains_key(&upage) {
            return Err(PageTableError::AlreadyPresent);
        }
        trace!("spt: install {upage:#x} as {:?}", state.status);
        let entry = Arc::new(PageEntry {
            upage,
            state: Mutex::new(state),
        });
        pages.insert(upage, entry.clone());
        Ok(entry)
    }

    /// Registers a page to be read from `backing` on first access. No I/O
    /// happens here.
    pub fn install_filesys(
        &self,
        upage: usize,
        backing: FileBacking,
        writable: bool,
    ) -> Result<Arc<PageEntry>> {
        self.insert(
            upage,
            PageState::new(PageStatus::FromFilesys, Some(backing), writable),
        )
    }

    /// Registers a page that reads as zeros until first written.
    pub fn install_zero(&self, upage: usize, writable: bool) -> Result<Arc<PageEntry>> {
        self.insert(upage, PageState::new(PageStatus::AllZero, None, writable))
    }

    /// Registers a page that is already resident in `frame`. The caller maps
    /// it and attaches the frame.
    pub fn install_frame(
        &self,
        upage: usize,
        frame: Frame,
        writable: bool,
    ) -> Result<Arc<PageEntry>> {
        self.insert(
            upage,
            PageState::new(PageStatus::OnFrame(frame), None, writable),
        )
    }

    /// Entry for the page containing `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<Arc<PageEntry>> {
        self.pages.lock().get(&page_round_down(vaddr)).cloned()
    }

    pub fn has_entry(&self, vaddr: usize) -> bool {
        self.pages.lock().contains_key(&page_round_down(vaddr))
    }

    fn with_entry<R>(&self, vaddr: usize, f: impl FnOnce(&mut PageState) -> R) -> Result<R> {
        let entry = self.lookup(vaddr).ok_or(PageTableError::NotPresent)?;
        let mut state = entry.lock();
        Ok(f(&mut state))
    }

    /// Records that the page now lives in `slot`. A resident page only leaves
    /// its frame through eviction, which releases the frame too.
    pub fn set_swap(&self, vaddr: usize, slot: SwapSlot) -> Result<()> {
        self.with_entry(vaddr, |state| {
            if state.is_resident() {
                return Err(PageTableError::Resident);
            }
            state.set_swap(slot);
            Ok(())
        })?
    }

    pub fn set_dirty(&self, vaddr: usize, dirty: bool) -> Result<()> {
        self.with_entry(vaddr, |state| state.set_dirty(dirty))
    }

    /// Keeps the page's frame from being evicted until a matching
    /// [`unpin`](Self::unpin). Nests.
    pub fn pin(&self, vaddr: usize) -> Result<()> {
        self.with_entry(vaddr, |state| state.pin_count += 1)
    }

    pub fn unpin(&self, vaddr: usize) -> Result<()> {
        self.with_entry(vaddr, |state| {
            debug_assert!(state.pin_count > 0, "unpin of unpinned page {vaddr:#x}");
            state.pin_count = state.pin_count.saturating_sub(1);
        })
    }

    /// Takes the entry out of the table. The caller releases whatever it
    /// holds with [`FrameAllocator::release_page`].
    pub fn remove(&self, vaddr: usize) -> Option<Arc<PageEntry>> {
        self.pages.lock().remove(&page_round_down(vaddr))
    }

    /// Releases every entry: frames go back to `frames`, swap slots to the
    /// swap store and file references are dropped. Nothing is written back.
    pub fn destroy(&self, frames: &FrameAllocator, page_dir: &PageManager) {
        let entries: Vec<_> = self.pages.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            frames.release_page(&entry, page_dir, false);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    const PAGE: usize = 0x1000_0000;

    fn backing(file: &Arc<TempFile>) -> FileBacking {
        FileBacking {
            file: FileHandle::open(file.clone()),
            offset: 0,
            read_bytes: 10,
            zero_bytes: PAGE_FRAME_SIZE - 10,
            write_back: true,
        }
    }

    #[test]
    fn install_and_lookup() {
        let spt = SupplementalPageTable::new();
        let file = Arc::new(TempFile::new(b"0123456789".to_vec()));

        spt.install_filesys(PAGE, backing(&file), true).unwrap();
        assert!(spt.has_entry(PAGE));
        assert!(spt.has_entry(PAGE + 123));
        assert!(!spt.has_entry(PAGE + PAGE_FRAME_SIZE));

        let entry = spt.lookup(PAGE + 7).unwrap();
        assert_eq!(entry.upage(), PAGE);
        let state = entry.lock();
        assert_eq!(state.status, PageStatus::FromFilesys);
        assert!(state.writable);
        assert_eq!(state.backing.as_ref().map(|b| b.read_bytes), Some(10));
    }

    #[test]
    fn duplicate_install_leaves_entry_alone() {
        let spt = SupplementalPageTable::new();
        spt.install_zero(PAGE, false).unwrap();
        let file = Arc::new(TempFile::new(b"x".to_vec()));

        assert_eq!(
            spt.install_filesys(PAGE, backing(&file), true).err(),
            Some(PageTableError::AlreadyPresent)
        );
        let entry = spt.lookup(PAGE).unwrap();
        let state = entry.lock();
        assert_eq!(state.status, PageStatus::AllZero);
        assert!(!state.writable);
        drop(state);
        // The rejected backing was dropped, closing its handle.
        assert_eq!(file.open_count(), 0);
    }

    #[test]
    fn pins_nest() {
        let spt = SupplementalPageTable::new();
        spt.install_zero(PAGE, true).unwrap();
        spt.pin(PAGE).unwrap();
        spt.pin(PAGE + 4).unwrap();
        spt.unpin(PAGE).unwrap();
        assert!(spt.lookup(PAGE).unwrap().lock().is_pinned());
        spt.unpin(PAGE).unwrap();
        assert!(!spt.lookup(PAGE).unwrap().lock().is_pinned());

        assert_eq!(spt.pin(PAGE * 2), Err(PageTableError::NotPresent));
    }

    #[test]
    fn set_swap_refuses_resident_page() {
        let spt = SupplementalPageTable::new();
        spt.install_frame(PAGE, Frame::from_number(3), true).unwrap();
        assert_eq!(
            spt.set_swap(PAGE, SwapSlot::new(0)),
            Err(PageTableError::Resident)
        );
        assert_eq!(
            spt.lookup(PAGE).unwrap().lock().frame(),
            Some(Frame::from_number(3))
        );

        spt.install_zero(2 * PAGE, true).unwrap();
        spt.set_swap(2 * PAGE, SwapSlot::new(1)).unwrap();
        assert_eq!(
            spt.lookup(2 * PAGE).unwrap().lock().status,
            PageStatus::OnSwap(SwapSlot::new(1))
        );
        assert_eq!(spt.set_swap(3 * PAGE, SwapSlot::new(2)), Err(PageTableError::NotPresent));
    }

    #[test]
    fn dirty_is_sticky_in_modified() {
        let spt = SupplementalPageTable::new();
        spt.install_zero(PAGE, true).unwrap();
        spt.set_dirty(PAGE, true).unwrap();
        spt.set_dirty(PAGE, false).unwrap();
        let entry = spt.lookup(PAGE).unwrap();
        let state = entry.lock();
        assert!(!state.dirty);
        assert!(state.modified);
    }

    #[test]
    fn remove_drops_entry() {
        let spt = SupplementalPageTable::new();
        spt.install_zero(PAGE, true).unwrap();
        assert_eq!(spt.len(), 1);
        assert!(spt.remove(PAGE + 1).is_some());
        assert!(spt.is_empty());
        assert!(spt.remove(PAGE).is_none());
    }
}
