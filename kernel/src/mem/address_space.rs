//! A process's user address space: its supplemental page table, its page
//! directory and its memory-mapped regions, plus the handle to the shared
//! frame pool they draw from.
//!
//! A process is single-threaded: its own faults, `munmap` and `destroy`
//! never run concurrently with each other. Other processes reach in only
//! through the evictor.

use super::frame_allocator::{AllocFlags, FrameAllocator, FrameOwner};
use super::page_table::{FileBacking, PageEntry, PageStatus, PageTableError, SupplementalPageTable};
use super::vma::{MapId, MmapError, MmapRegion, MmapTable};
use crate::config::StackGrowthPolicy;
use crate::fs::{FileHandle, FsError};
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::threading::Pid;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_shared::mem::{is_page_aligned, page_round_down, pages_spanned, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, trace, warn};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("no page registered at this address")]
    NoEntry,
    #[error("reading the backing file failed: {0}")]
    Io(#[from] FsError),
}

pub struct AddressSpace {
    pid: Pid,
    spt: SupplementalPageTable,
    page_dir: Arc<PageManager>,
    frames: Arc<FrameAllocator>,
    stack: StackGrowthPolicy,
    mmaps: Mutex<MmapTable>,
}

impl AddressSpace {
    pub fn new(pid: Pid, frames: Arc<FrameAllocator>, stack: StackGrowthPolicy) -> Self {
        Self {
            pid,
            spt: SupplementalPageTable::new(),
            page_dir: Arc::new(PageManager::new()),
            frames,
            stack,
            mmaps: Mutex::new(MmapTable::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }
    pub fn page_dir(&self) -> &Arc<PageManager> {
        &self.page_dir
    }
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }
    pub fn stack_policy(&self) -> &StackGrowthPolicy {
        &self.stack
    }

    fn owner(&self, entry: Arc<PageEntry>) -> FrameOwner {
        FrameOwner {
            pid: self.pid,
            entry,
            page_dir: self.page_dir.clone(),
        }
    }

    /// Makes the page containing `vaddr` resident and mapped.
    ///
    /// The entry lock is held while the frame is acquired and filled, so the
    /// page goes from its old location to [`PageStatus::OnFrame`] in one step.
    /// The frame becomes evictable only once it is attached at the end.
    pub fn load_page(&self, vaddr: usize) -> Result<(), LoadError> {
        let entry = self.spt.lookup(vaddr).ok_or(LoadError::NoEntry)?;
        let upage = entry.upage();
        let mut state = entry.lock();

        if let Some(frame) = state.frame() {
            if !self.page_dir.is_mapped(upage) {
                self.page_dir.map(upage, frame.number(), state.writable);
            }
            return Ok(());
        }

        let frame = self.frames.get_frame(AllocFlags::empty());
        let mut swapped_from = None;
        let filled = match state.status {
            PageStatus::AllZero => {
                self.frames.with_frame(frame, |page| page.fill(0));
                Ok(())
            }
            PageStatus::OnSwap(slot) => {
                self.frames.swap_in(slot, frame);
                swapped_from = Some(slot);
                Ok(())
            }
            PageStatus::FromFilesys => match &state.backing {
                Some(backing) => self.frames.with_frame(frame, |page| {
                    let read = backing
                        .file
                        .read_at(backing.offset, &mut page[..backing.read_bytes])?;
                    // A file shorter than recorded reads as zeros past its end.
                    page[read..].fill(0);
                    Ok(())
                }),
                None => {
                    self.frames.with_frame(frame, |page| page.fill(0));
                    Ok(())
                }
            },
            PageStatus::OnFrame(_) => unreachable!("resident pages return early"),
        };
        if let Err(err) = filled {
            drop(state);
            self.frames.free_frame(frame);
            return Err(LoadError::Io(err));
        }

        trace!(
            "pid {}: loaded {upage:#x} from {:?} into {frame}",
            self.pid,
            state.status
        );
        state.status = PageStatus::OnFrame(frame);
        // A mapped file page back from swap is not in its file yet.
        state.dirty = swapped_from.is_some()
            && state.backing.as_ref().is_some_and(|backing| backing.write_back);
        self.page_dir.map(upage, frame.number(), state.writable);
        drop(state);

        if let Some(slot) = swapped_from {
            self.frames.free_slot(slot);
        }
        self.frames.attach(frame, self.owner(entry));
        Ok(())
    }

    /// Registers a zero page at the page containing `vaddr` and loads it.
    pub fn grow_stack(&self, vaddr: usize) -> Result<(), LoadError> {
        let upage = page_round_down(vaddr);
        debug!("pid {}: growing stack to {upage:#x}", self.pid);
        // Already registered means someone else grew it; loading is all that
        // is left.
        let _ = self.spt.install_zero(upage, true);
        self.load_page(upage)
    }

    /// Installs the first stack page right below the top of user memory and
    /// returns the initial stack pointer.
    pub fn setup_stack(&self) -> Result<usize, PageTableError> {
        let upage = OFFSET - PAGE_FRAME_SIZE;
        let frame = self.frames.get_frame(AllocFlags::ZERO);
        let entry = match self.spt.install_frame(upage, frame, true) {
            Ok(entry) => entry,
            Err(err) => {
                self.frames.free_frame(frame);
                return Err(err);
            }
        };
        self.page_dir.map(upage, frame.number(), true);
        self.frames.attach(frame, self.owner(entry));
        Ok(OFFSET)
    }

    /// Registers the pages of an executable segment to be read lazily.
    ///
    /// `read_bytes + zero_bytes` must be a whole number of pages starting at
    /// page-aligned `upage`. Dirtied segment pages go to swap, never back to
    /// the executable.
    pub fn load_segment(
        &self,
        file: &FileHandle,
        mut offset: u64,
        mut upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), PageTableError> {
        assert!(is_page_aligned(upage));
        assert!(is_page_aligned(read_bytes + zero_bytes));

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = min(read_bytes, PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            if page_read_bytes == 0 {
                self.spt.install_zero(upage, writable)?;
            } else {
                let backing = FileBacking {
                    file: file.clone(),
                    offset,
                    read_bytes: page_read_bytes,
                    zero_bytes: page_zero_bytes,
                    write_back: false,
                };
                self.spt.install_filesys(upage, backing, writable)?;
            }

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes as u64;
            upage += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Maps all of `file` at `addr`. Pages are read on first access.
    pub fn mmap(&self, file: FileHandle, addr: usize) -> Result<MapId, MmapError> {
        if !is_page_aligned(addr) {
            return Err(MmapError::Unaligned);
        }
        let len = usize::try_from(file.len()).map_err(|_| MmapError::NotUserAddress)?;
        if len == 0 {
            return Err(MmapError::EmptyFile);
        }
        if addr == 0 || addr.checked_add(len).map_or(true, |end| end > OFFSET) {
            return Err(MmapError::NotUserAddress);
        }

        let mut mmaps = self.mmaps.lock();
        if pages_spanned(addr, len).any(|upage| self.spt.has_entry(upage)) {
            return Err(MmapError::Overlap);
        }

        for (i, upage) in pages_spanned(addr, len).enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_bytes = min(PAGE_FRAME_SIZE, len - offset);
            let backing = FileBacking {
                file: file.clone(),
                offset: offset as u64,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
                write_back: true,
            };
            self.spt
                .install_filesys(upage, backing, true)
                .map_err(|_| MmapError::Overlap)?;
        }

        let id = mmaps.insert(addr, len);
        debug!(
            "pid {}: mmap {id} at {addr:#x}, {len} bytes",
            self.pid
        );
        Ok(id)
    }

    /// Writes back dirty resident pages of mapping `id` and removes it. An
    /// unknown id does nothing.
    pub fn munmap(&self, id: MapId) -> bool {
        let Some(region) = self.mmaps.lock().remove(id) else {
            warn!("pid {}: munmap of unknown mapping {id}", self.pid);
            return false;
        };
        self.unmap_region(region);
        true
    }

    fn unmap_region(&self, region: MmapRegion) {
        for upage in region.pages() {
            if let Some(entry) = self.spt.remove(upage) {
                self.frames.release_page(&entry, &self.page_dir, true);
            }
        }
        debug!("pid {}: unmapped {}", self.pid, region.id());
    }

    pub fn mapping_count(&self) -> usize {
        self.mmaps.lock().len()
    }

    /// Tears everything down: unmaps every region (with write-back), then
    /// releases every remaining page.
    pub fn destroy(&self) {
        let regions: alloc::vec::Vec<_> = self.mmaps.lock().drain().collect();
        for region in regions {
            self.unmap_region(region);
        }
        self.spt.destroy(&self.frames, &self.page_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::fs::tempfs::TempFile;
    use crate::fs::File;
    use crate::mem::swapping::SECTORS_PER_SLOT;
    use alloc::{vec, vec::Vec};
    use core::sync::atomic::{AtomicBool, Ordering};

    const BASE: usize = 0x1000_0000;

    fn frames(count: usize) -> Arc<FrameAllocator> {
        Arc::new(FrameAllocator::with_ram_swap(&VmConfig {
            user_frames: count,
            swap_sectors: (16 * SECTORS_PER_SLOT) as u32,
            ..VmConfig::default()
        }))
    }

    fn space(frames: &Arc<FrameAllocator>) -> AddressSpace {
        AddressSpace::new(1, frames.clone(), StackGrowthPolicy::default())
    }

    /// Reads a byte through the page directory, loading the page on a miss.
    fn read(space: &AddressSpace, addr: usize) -> u8 {
        loop {
            let got = space.page_dir().access(addr, false, |frame| {
                space.frames().with_frame(crate::mem::Frame::from_number(frame), |page| {
                    page[addr % PAGE_FRAME_SIZE]
                })
            });
            match got {
                Ok(byte) => return byte,
                Err(_) => space.load_page(addr).unwrap(),
            }
        }
    }

    fn write(space: &AddressSpace, addr: usize, value: u8) {
        loop {
            let done = space.page_dir().access(addr, true, |frame| {
                space.frames().with_frame(crate::mem::Frame::from_number(frame), |page| {
                    page[addr % PAGE_FRAME_SIZE] = value;
                })
            });
            match done {
                Ok(()) => return,
                Err(_) => space.load_page(addr).unwrap(),
            }
        }
    }

    #[test]
    fn ten_byte_file_mapping() {
        let frames = frames(4);
        let space = space(&frames);
        let file = Arc::new(TempFile::new(b"0123456789".to_vec()));

        let id = space.mmap(FileHandle::open(file.clone()), BASE).unwrap();
        assert_eq!(id, 1);
        assert_eq!(space.spt().len(), 1);

        assert_eq!(read(&space, BASE), b'0');
        assert_eq!(read(&space, BASE + 9), b'9');
        assert_eq!(read(&space, BASE + 10), 0);
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE - 1), 0);

        write(&space, BASE, b'X');
        assert!(space.munmap(id));
        assert_eq!(file.contents(), b"X123456789".to_vec());
        assert_eq!(frames.frames_in_use(), 0);
        assert!(space.spt().is_empty());
        // The mapping's handle is closed with it.
        assert_eq!(file.open_count(), 0);
    }

    #[test]
    fn mmap_rejections() {
        let frames = frames(2);
        let space = space(&frames);
        let file = Arc::new(TempFile::new(vec![1; PAGE_FRAME_SIZE + 1]));
        let empty = Arc::new(TempFile::new(Vec::new()));

        assert_eq!(
            space.mmap(FileHandle::open(file.clone()), BASE + 1),
            Err(MmapError::Unaligned)
        );
        assert_eq!(
            space.mmap(FileHandle::open(file.clone()), 0),
            Err(MmapError::NotUserAddress)
        );
        assert_eq!(
            space.mmap(FileHandle::open(file.clone()), OFFSET - PAGE_FRAME_SIZE),
            Err(MmapError::NotUserAddress)
        );
        assert_eq!(
            space.mmap(FileHandle::open(empty.clone()), BASE),
            Err(MmapError::EmptyFile)
        );
        assert_eq!(file.open_count(), 0);
        assert_eq!(empty.open_count(), 0);
    }

    #[test]
    fn overlapping_mmap_changes_nothing() {
        let frames = frames(2);
        let space = space(&frames);
        let file = Arc::new(TempFile::new(vec![7; 2 * PAGE_FRAME_SIZE]));
        // Second page of the new mapping collides with this one.
        space
            .spt()
            .install_zero(BASE + PAGE_FRAME_SIZE, false)
            .unwrap();

        assert_eq!(
            space.mmap(FileHandle::open(file.clone()), BASE),
            Err(MmapError::Overlap)
        );
        assert!(!space.spt().has_entry(BASE));
        assert_eq!(space.spt().len(), 1);
        let entry = space.spt().lookup(BASE + PAGE_FRAME_SIZE).unwrap();
        let state = entry.lock();
        assert_eq!(state.status, PageStatus::AllZero);
        assert!(!state.writable);
        assert!(state.backing.is_none());
        drop(state);
        assert_eq!(space.mapping_count(), 0);
        assert_eq!(file.open_count(), 0);
    }

    #[test]
    fn munmap_unknown_id_is_noop() {
        let frames = frames(1);
        let space = space(&frames);
        assert!(!space.munmap(42));
    }

    #[test]
    fn dirty_file_page_survives_eviction() {
        let frames = frames(1);
        let space = space(&frames);
        let file = Arc::new(TempFile::new(vec![b'a'; 2 * PAGE_FRAME_SIZE]));
        space.mmap(FileHandle::open(file.clone()), BASE).unwrap();

        write(&space, BASE + 5, b'Q');
        // Only one frame: touching the second page evicts the first.
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE), b'a');
        assert_eq!(file.contents()[5], b'Q');
        assert_eq!(frames.stats().write_backs, 1);

        assert_eq!(read(&space, BASE + 5), b'Q');
        assert_eq!(frames.swap_slots_in_use(), 0);
    }

    #[test]
    fn refused_write_back_parks_page_in_swap() {
        let frames = frames(1);
        let space = space(&frames);
        let file = Arc::new(TempFile::read_only(vec![b'a'; 2 * PAGE_FRAME_SIZE]));
        space.mmap(FileHandle::open(file.clone()), BASE).unwrap();

        write(&space, BASE, b'Q');
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE), b'a');
        assert!(matches!(
            space.spt().lookup(BASE).unwrap().lock().status,
            PageStatus::OnSwap(_)
        ));
        assert_eq!(read(&space, BASE), b'Q');
        assert_eq!(frames.swap_slots_in_use(), 0);

        // Still not in the file, so a second eviction must keep it too.
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE), b'a');
        assert_eq!(frames.swap_slots_in_use(), 1);
        assert_eq!(read(&space, BASE), b'Q');

        read(&space, BASE + PAGE_FRAME_SIZE);
        assert!(space.munmap(1));
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert_eq!(frames.frames_in_use(), 0);
        assert_eq!(file.contents(), vec![b'a'; 2 * PAGE_FRAME_SIZE]);
        assert_eq!(frames.stats().write_backs, 0);
    }

    /// A file whose writes fail until `accept` is set.
    struct FullDisk {
        inner: TempFile,
        accept: AtomicBool,
    }

    impl File for FullDisk {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::fs::Result<usize> {
            self.inner.read_at(offset, buf)
        }
        fn write_at(&self, offset: u64, buf: &[u8]) -> crate::fs::Result<usize> {
            if !self.accept.load(Ordering::Relaxed) {
                return Err(FsError::NoSpace);
            }
            self.inner.write_at(offset, buf)
        }
        fn len(&self) -> u64 {
            self.inner.len()
        }
    }

    #[test]
    fn parked_page_reaches_file_on_munmap() {
        let frames = frames(1);
        let space = space(&frames);
        let disk = Arc::new(FullDisk {
            inner: TempFile::new(vec![b'a'; 2 * PAGE_FRAME_SIZE]),
            accept: AtomicBool::new(false),
        });
        let id = space.mmap(FileHandle::open(disk.clone()), BASE).unwrap();

        write(&space, BASE + 1, b'Z');
        read(&space, BASE + PAGE_FRAME_SIZE);
        assert_eq!(frames.swap_slots_in_use(), 1);

        disk.accept.store(true, Ordering::Relaxed);
        assert!(space.munmap(id));
        assert_eq!(&disk.inner.contents()[..3], b"aZa");
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert_eq!(frames.stats().write_backs, 1);
    }

    #[test]
    fn stale_map_id_does_not_reach_new_mapping() {
        let frames = frames(2);
        let space = space(&frames);
        let file = Arc::new(TempFile::new(vec![b'f'; 10]));

        let first = space.mmap(FileHandle::open(file.clone()), BASE).unwrap();
        assert!(space.munmap(first));
        let second = space.mmap(FileHandle::open(file.clone()), BASE).unwrap();
        assert_ne!(first, second);

        assert!(!space.munmap(first));
        assert_eq!(space.mapping_count(), 1);
        assert_eq!(read(&space, BASE), b'f');
    }

    #[test]
    fn anonymous_page_round_trips_through_swap() {
        let frames = frames(1);
        let space = space(&frames);
        space.spt().install_zero(BASE, true).unwrap();
        space.spt().install_zero(BASE + PAGE_FRAME_SIZE, true).unwrap();

        for i in 0..PAGE_FRAME_SIZE {
            write(&space, BASE + i, (i % 253) as u8);
        }
        // Evicts the first page to swap.
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE), 0);
        assert_eq!(frames.swap_slots_in_use(), 1);
        assert!(matches!(
            space.spt().lookup(BASE).unwrap().lock().status,
            PageStatus::OnSwap(_)
        ));

        for i in 0..PAGE_FRAME_SIZE {
            assert_eq!(read(&space, BASE + i), (i % 253) as u8);
        }
        // Second page was never written, so it was discarded, and the slot
        // was freed once the first page came back.
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert_eq!(
            space.spt().lookup(BASE + PAGE_FRAME_SIZE).unwrap().lock().status,
            PageStatus::AllZero
        );
        let stats = frames.stats();
        assert_eq!(stats.swap_outs, 1);
        assert_eq!(stats.swap_ins, 1);
    }

    #[test]
    fn clean_segment_page_is_reread_not_written() {
        let frames = frames(1);
        let space = space(&frames);
        let exe = Arc::new(TempFile::read_only(vec![0x90; PAGE_FRAME_SIZE + 100]));
        let handle = FileHandle::open(exe.clone());
        space
            .load_segment(&handle, 0, BASE, PAGE_FRAME_SIZE + 100, PAGE_FRAME_SIZE - 100, true)
            .unwrap();
        assert_eq!(space.spt().len(), 2);

        assert_eq!(read(&space, BASE), 0x90);
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE + 99), 0x90);
        assert_eq!(read(&space, BASE + PAGE_FRAME_SIZE + 100), 0);
        assert_eq!(
            space.spt().lookup(BASE).unwrap().lock().status,
            PageStatus::FromFilesys
        );
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert_eq!(frames.stats().write_backs, 0);
    }

    #[test]
    fn dirty_segment_page_goes_to_swap() {
        let frames = frames(1);
        let space = space(&frames);
        let exe = Arc::new(TempFile::read_only(vec![1; 2 * PAGE_FRAME_SIZE]));
        let handle = FileHandle::open(exe.clone());
        space
            .load_segment(&handle, 0, BASE, 2 * PAGE_FRAME_SIZE, 0, true)
            .unwrap();

        write(&space, BASE, 2);
        read(&space, BASE + PAGE_FRAME_SIZE);
        assert!(matches!(
            space.spt().lookup(BASE).unwrap().lock().status,
            PageStatus::OnSwap(_)
        ));
        assert_eq!(exe.contents()[0], 1);
        assert_eq!(read(&space, BASE), 2);
    }

    #[test]
    fn destroy_releases_everything() {
        let frames = frames(2);
        let space = space(&frames);
        let mapped = Arc::new(TempFile::new(vec![b'm'; 2 * PAGE_FRAME_SIZE]));
        let exe = Arc::new(TempFile::read_only(vec![b'e'; PAGE_FRAME_SIZE]));
        let exe_handle = FileHandle::open(exe.clone());
        space
            .load_segment(&exe_handle, 0, BASE, PAGE_FRAME_SIZE, 0, true)
            .unwrap();
        drop(exe_handle);
        space.mmap(FileHandle::open(mapped.clone()), BASE + 0x10_0000).unwrap();
        for i in 1..4 {
            space
                .spt()
                .install_zero(BASE + i * PAGE_FRAME_SIZE, true)
                .unwrap();
        }
        space.setup_stack().unwrap();

        // Dirty three anonymous pages through two free frames: some of them
        // end up in swap.
        for i in 1..4 {
            write(&space, BASE + i * PAGE_FRAME_SIZE, 0xEE);
        }
        write(&space, BASE + 0x10_0000, b'M');
        read(&space, BASE);
        assert!(frames.swap_slots_in_use() > 0);

        space.destroy();
        assert_eq!(frames.frames_in_use(), 0);
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert_eq!(space.page_dir().mapped_count(), 0);
        assert!(space.spt().is_empty());
        assert_eq!(space.mapping_count(), 0);
        assert_eq!(exe.open_count(), 0);
        assert_eq!(mapped.open_count(), 0);
        assert_eq!(mapped.contents()[0], b'M');
    }

    #[test]
    fn setup_stack_maps_top_page() {
        let frames = frames(2);
        let space = space(&frames);
        assert_eq!(space.setup_stack(), Ok(OFFSET));
        assert!(space.page_dir().is_mapped(OFFSET - 1));
        assert_eq!(read(&space, OFFSET - 4), 0);
        assert_eq!(space.setup_stack(), Err(PageTableError::AlreadyPresent));
        assert_eq!(frames.frames_in_use(), 1);
    }
}
