//! The global pool of user frames.
//!
//! All bookkeeping (core map, reverse map, placement and replacement state,
//! the swap store) sits behind one lock, so choosing a frame and evicting its
//! previous owner happen atomically with respect to every other request.
//! Frame contents have their own per-frame locks.

mod placement_algorithms;

use super::page_replacement::{Candidate, Clock, PageReplacementPolicy};
use super::page_table::{FileBacking, PageEntry, PageStatus};
use super::swapping::{SwapSlot, SwapStore};
use crate::block::block_core::{Block, BlockType};
use crate::config::VmConfig;
use crate::drivers::ram_disk::RamDisk;
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::threading::Pid;
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use bitbybit::bitfield;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, error, trace};
use placement_algorithms::{NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    // Handed out but not yet attached to a page; never evicted.
    #[bit(1, rw)]
    pinned: bool,
    #[bit(2, rw)]
    is_kernel: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Zero the frame before returning it.
        const ZERO = 1 << 0;
        /// The frame is for kernel use and is never evicted.
        const KERNEL = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    /// The frame a page directory entry points at.
    pub(crate) fn from_number(number: usize) -> Self {
        Self(number)
    }

    pub fn number(self) -> usize {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

/// Reverse mapping from a frame to the page that lives in it.
pub struct FrameOwner {
    pub pid: Pid,
    pub entry: Arc<PageEntry>,
    pub page_dir: Arc<PageManager>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_in_use: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
    pub write_backs: usize,
}

struct FrameTable {
    core_map: Box<[CoreMapEntry]>,
    owners: Box<[Option<FrameOwner>]>,
    placement: NextFit,
    replacement: Clock,
    swap: SwapStore,
    frames_allocated: usize,
}

impl FrameTable {
    fn claim(&mut self, frame: usize, flags: AllocFlags) {
        self.core_map[frame] = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pinned(true)
            .with_is_kernel(flags.contains(AllocFlags::KERNEL));
    }

    fn take_free(&mut self, flags: AllocFlags) -> Option<Frame> {
        let frame = self.placement.place(&self.core_map)?;
        self.claim(frame, flags);
        self.frames_allocated += 1;
        Some(Frame(frame))
    }

    fn release(&mut self, frame: Frame) {
        assert!(
            self.core_map[frame.0].allocated(),
            "double free of {frame}"
        );
        self.core_map[frame.0] = CoreMapEntry::DEFAULT;
        self.owners[frame.0] = None;
        self.frames_allocated -= 1;
    }
}

fn inspect(core_map: &[CoreMapEntry], owners: &[Option<FrameOwner>], frame: usize) -> Candidate {
    let entry = core_map[frame];
    if !entry.allocated() || entry.pinned() || entry.is_kernel() {
        return Candidate::Skip;
    }
    let Some(owner) = &owners[frame] else {
        return Candidate::Skip;
    };
    if owner.entry.lock().is_pinned() {
        return Candidate::Skip;
    }
    if owner.page_dir.take_accessed(owner.entry.upage()) {
        Candidate::Referenced
    } else {
        Candidate::Evictable
    }
}

pub struct FrameAllocator {
    table: Mutex<FrameTable>,
    memory: Box<[Mutex<Box<[u8]>>]>,
    evictions: AtomicUsize,
    swap_outs: AtomicUsize,
    swap_ins: AtomicUsize,
    write_backs: AtomicUsize,
}

impl FrameAllocator {
    pub fn new(frames: usize, swap: SwapStore) -> Self {
        let memory: Vec<_> = (0..frames)
            .map(|_| Mutex::new(vec![0u8; PAGE_FRAME_SIZE].into_boxed_slice()))
            .collect();
        let owners: Vec<Option<FrameOwner>> = (0..frames).map(|_| None).collect();

        Self {
            table: Mutex::new(FrameTable {
                core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                owners: owners.into_boxed_slice(),
                placement: NextFit::default(),
                replacement: Clock::default(),
                swap,
                frames_allocated: 0,
            }),
            memory: memory.into_boxed_slice(),
            evictions: AtomicUsize::new(0),
            swap_outs: AtomicUsize::new(0),
            swap_ins: AtomicUsize::new(0),
            write_backs: AtomicUsize::new(0),
        }
    }

    /// Builds the pool described by `config` with an in-memory swap device.
    pub fn with_ram_swap(config: &VmConfig) -> Self {
        let device = Block::new(
            "swap",
            BlockType::Swap,
            config.swap_sectors,
            Box::new(RamDisk::new(config.swap_sectors)),
        );
        Self::new(config.user_frames, SwapStore::new(device))
    }

    /// Hands out a frame, evicting another page's frame if none is free.
    ///
    /// The frame stays out of eviction's reach until it is passed to
    /// [`attach`](Self::attach) (user pages) or [`free_frame`](Self::free_frame).
    /// If every frame is pinned this spins until one is released.
    pub fn get_frame(&self, flags: AllocFlags) -> Frame {
        loop {
            let mut table = self.table.lock();
            let frame = match table.take_free(flags) {
                Some(frame) => Some(frame),
                None => self.evict(&mut table, flags),
            };
            drop(table);

            if let Some(frame) = frame {
                if flags.contains(AllocFlags::ZERO) {
                    self.with_frame(frame, |page| page.fill(0));
                }
                trace!("frames: handing out {frame} ({flags:?})");
                return frame;
            }

            // Every frame is pinned or held by the kernel; wait for an unpin.
            core::hint::spin_loop();
        }
    }

    /// Picks a victim and moves its page out of memory. The victim's frame
    /// comes back claimed for the caller.
    fn evict(&self, table: &mut FrameTable, flags: AllocFlags) -> Option<Frame> {
        let FrameTable {
            core_map,
            owners,
            replacement,
            ..
        } = table;
        let victim = replacement.select_victim(core_map.len(), |i| inspect(core_map, owners, i))?;

        let (pid, entry, page_dir) = {
            let owner = table.owners[victim].as_ref()?;
            (owner.pid, owner.entry.clone(), owner.page_dir.clone())
        };
        let mut guard = entry.lock();
        // Pinned after the clock looked at it.
        if guard.is_pinned() {
            return None;
        }
        table.owners[victim] = None;

        let frame = Frame(victim);
        let upage = entry.upage();
        debug_assert_eq!(guard.frame(), Some(frame));

        let hw_dirty = page_dir.unmap(upage).is_some_and(|pte| pte.dirty());
        let state = &mut *guard;
        state.set_dirty(state.dirty || hw_dirty);
        let dirty = state.dirty;

        state.status = match &state.backing {
            // A file that refuses the write keeps nothing; the page goes to
            // swap instead and is retried on its next eviction.
            Some(backing)
                if backing.write_back && (!dirty || self.write_back(frame, backing)) =>
            {
                PageStatus::FromFilesys
            }
            Some(backing) if !backing.write_back && !state.modified => PageStatus::FromFilesys,
            Some(_) => self.swap_out(&mut table.swap, frame),
            None if state.modified => self.swap_out(&mut table.swap, frame),
            None => PageStatus::AllZero,
        };
        state.set_dirty(false);
        debug!(
            "frames: evicted {upage:#x} of pid {pid} from {frame} to {:?}",
            state.status
        );
        drop(guard);

        table.claim(victim, flags);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Writes `frame` to its file. Returns whether the file took it.
    fn write_back(&self, frame: Frame, backing: &FileBacking) -> bool {
        let page = self.memory[frame.0].lock();
        self.write_page_back(&page, backing)
    }

    fn write_page_back(&self, page: &[u8], backing: &FileBacking) -> bool {
        if let Err(err) = backing
            .file
            .write_at(backing.offset, &page[..backing.read_bytes])
        {
            error!("frames: write-back at offset {} failed: {err}", backing.offset);
            return false;
        }
        self.write_backs.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn swap_out(&self, swap: &mut SwapStore, frame: Frame) -> PageStatus {
        let slot = swap.allocate_slot();
        let page = self.memory[frame.0].lock();
        if let Err(err) = swap.write(slot, &page) {
            error!("frames: writing {frame} to swap {slot} failed: {err}");
            panic!("swap write failed");
        }
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
        PageStatus::OnSwap(slot)
    }

    /// Records `owner` as the page living in `frame` and makes the frame
    /// evictable.
    pub fn attach(&self, frame: Frame, owner: FrameOwner) {
        let mut table = self.table.lock();
        let entry = table.core_map[frame.0];
        assert!(entry.allocated(), "attach to free {frame}");
        table.core_map[frame.0] = entry.with_pinned(false);
        table.owners[frame.0] = Some(owner);
    }

    pub fn free_frame(&self, frame: Frame) {
        self.table.lock().release(frame);
        trace!("frames: freed {frame}");
    }

    /// Drops whatever `entry` holds: unmaps and frees its frame or frees its
    /// swap slot, and closes its file. With `write_back`, a dirty resident
    /// page of a memory-mapped file is written to the file first.
    pub fn release_page(&self, entry: &PageEntry, page_dir: &PageManager, write_back: bool) {
        let mut table = self.table.lock();
        let mut guard = entry.lock();
        let state = &mut *guard;

        match core::mem::replace(&mut state.status, PageStatus::AllZero) {
            PageStatus::OnFrame(frame) => {
                let hw_dirty = page_dir
                    .unmap(entry.upage())
                    .is_some_and(|pte| pte.dirty());
                if write_back && (state.dirty || hw_dirty) {
                    if let Some(backing) = state.backing.as_ref().filter(|b| b.write_back) {
                        self.write_back(frame, backing);
                    }
                }
                table.release(frame);
            }
            PageStatus::OnSwap(slot) => {
                // Parked in swap after its file refused a write-back.
                if let Some(backing) = state.backing.as_ref().filter(|b| write_back && b.write_back) {
                    let mut page = vec![0u8; PAGE_FRAME_SIZE];
                    match table.swap.read(slot, &mut page) {
                        Ok(()) => {
                            self.write_page_back(&page, backing);
                        }
                        Err(err) => error!("frames: reading swap {slot} for write-back failed: {err}"),
                    }
                }
                table.swap.free_slot(slot);
            }
            PageStatus::AllZero | PageStatus::FromFilesys => {}
        }
        state.backing = None;
        state.dirty = false;
    }

    /// Reads `slot` into `frame`. The slot stays allocated until
    /// [`free_slot`](Self::free_slot).
    pub fn swap_in(&self, slot: SwapSlot, frame: Frame) {
        let mut table = self.table.lock();
        let mut page = self.memory[frame.0].lock();
        if let Err(err) = table.swap.read(slot, &mut page) {
            error!("frames: reading swap {slot} into {frame} failed: {err}");
            panic!("swap read failed");
        }
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn free_slot(&self, slot: SwapSlot) {
        self.table.lock().swap.free_slot(slot);
    }

    /// Runs `f` on the contents of `frame`.
    pub fn with_frame<R>(&self, frame: Frame, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.memory[frame.0].lock())
    }

    /// The process and page living in `frame`, if any.
    pub fn owner(&self, frame: Frame) -> Option<(Pid, usize)> {
        let table = self.table.lock();
        table.owners[frame.0]
            .as_ref()
            .map(|owner| (owner.pid, owner.entry.upage()))
    }

    pub fn frames_in_use(&self) -> usize {
        self.table.lock().frames_allocated
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.table.lock().swap.slots_in_use()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_in_use: self.frames_in_use(),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }
}
