//! User processes, as far as virtual memory is concerned.

use crate::config::VmConfig;
use crate::fs::{file_table::FileTable, FileHandle};
use crate::interrupts::page_fault::{
    handle_page_fault, FaultOutcome, InterruptFrame, PageFault, PageFaultErrorCode,
};
use crate::mem::{address_space::AddressSpace, page_table::PageTableError, Frame, FrameAllocator};
use crate::paging::AccessFault;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{collections::BTreeMap, string::String, sync::Arc};
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::info;
use thiserror::Error;

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// Recorded while the kernel touches user memory for a process, so a fault
/// in kernel mode can be told apart from a kernel bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccess {
    pub addr: usize,
    /// User stack pointer at the time of the access.
    pub esp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("the process was terminated")]
    Terminated,
    #[error("the access was sent to its failure path")]
    Redirected,
}

pub struct Process {
    pid: Pid,
    name: String,
    space: AddressSpace,
    files: Mutex<FileTable>,
    user_esp: AtomicUsize,
    user_access: Mutex<Option<UserAccess>>,
    exit_status: Mutex<Option<i32>>,
}

/// Clears the user access record when dropped.
pub struct UserAccessGuard<'a> {
    process: &'a Process,
}

impl Drop for UserAccessGuard<'_> {
    fn drop(&mut self) {
        *self.process.user_access.lock() = None;
    }
}

impl Process {
    pub fn new(pid: Pid, name: &str, frames: Arc<FrameAllocator>, config: &VmConfig) -> Self {
        Self {
            pid,
            name: String::from(name),
            space: AddressSpace::new(pid, frames, config.stack.clone()),
            files: Mutex::new(FileTable::new()),
            user_esp: AtomicUsize::new(0),
            user_access: Mutex::new(None),
            exit_status: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn files(&self) -> MutexGuard<'_, FileTable> {
        self.files.lock()
    }

    pub fn user_esp(&self) -> usize {
        self.user_esp.load(Ordering::Relaxed)
    }

    pub fn set_user_esp(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::Relaxed);
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Registers an executable segment for lazy loading.
    pub fn load_segment(
        &self,
        file: &FileHandle,
        offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), PageTableError> {
        self.space
            .load_segment(file, offset, upage, read_bytes, zero_bytes, writable)
    }

    /// Installs the initial stack page and points the stack pointer at the
    /// top of user memory.
    pub fn setup_stack(&self) -> Result<(), PageTableError> {
        let esp = self.space.setup_stack()?;
        self.set_user_esp(esp);
        Ok(())
    }

    /// Marks the kernel as accessing `addr` on this process's behalf until the
    /// guard is dropped.
    pub fn begin_user_access(&self, addr: usize) -> UserAccessGuard<'_> {
        *self.user_access.lock() = Some(UserAccess {
            addr,
            esp: self.user_esp(),
        });
        UserAccessGuard { process: self }
    }

    pub fn user_access(&self) -> Option<UserAccess> {
        *self.user_access.lock()
    }

    /// Terminates the process: prints the exit line, unmaps every mapping
    /// (writing dirty pages back), frees all of its pages and closes its
    /// files. Only the first call does anything.
    pub fn exit(&self, status: i32) {
        {
            let mut exit_status = self.exit_status.lock();
            if exit_status.is_some() {
                return;
            }
            *exit_status = Some(status);
        }

        info!(target: "process", "{}: exit({status})", self.name);
        self.space.destroy();
        self.files.lock().clear();
    }

    /// Register state of the user context, as a trap from user mode would
    /// see it.
    pub fn user_frame(&self) -> InterruptFrame {
        InterruptFrame {
            eip: 0,
            eax: 0,
            esp: self.user_esp(),
        }
    }

    /// Performs a one-byte load (or store of `store`) at `addr` the way the
    /// CPU would: through the page directory, raising a page fault on a miss
    /// and retrying once the fault is resolved.
    pub(crate) fn access_byte(
        &self,
        addr: usize,
        store: Option<u8>,
        user: bool,
        intr: &mut InterruptFrame,
    ) -> Result<u8, AccessError> {
        let page_dir = self.space.page_dir();
        let frames = self.space.frames();
        loop {
            if self.is_terminated() {
                return Err(AccessError::Terminated);
            }

            let result = page_dir.access(addr, store.is_some(), |frame| {
                frames.with_frame(Frame::from_number(frame), |page| {
                    let byte = &mut page[addr % PAGE_FRAME_SIZE];
                    if let Some(value) = store {
                        *byte = value;
                    }
                    *byte
                })
            });
            let fault = match result {
                Ok(byte) => return Ok(byte),
                Err(fault) => fault,
            };

            let fault = PageFault {
                addr,
                error_code: PageFaultErrorCode::DEFAULT
                    .with_present(fault == AccessFault::Protection)
                    .with_write(store.is_some())
                    .with_user(user),
            };
            match handle_page_fault(self, &fault, intr) {
                FaultOutcome::Resolved => {}
                FaultOutcome::Redirected => return Err(AccessError::Redirected),
                FaultOutcome::Terminated => return Err(AccessError::Terminated),
            }
        }
    }

    pub fn read_byte(&self, addr: usize) -> Result<u8, AccessError> {
        let mut intr = self.user_frame();
        self.access_byte(addr, None, true, &mut intr)
    }

    pub fn write_byte(&self, addr: usize, value: u8) -> Result<(), AccessError> {
        let mut intr = self.user_frame();
        self.access_byte(addr, Some(value), true, &mut intr)
            .map(|_| ())
    }

    pub fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_byte(addr + i)?;
        }
        Ok(())
    }

    pub fn write_bytes(&self, addr: usize, data: &[u8]) -> Result<(), AccessError> {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(addr + i, byte)?;
        }
        Ok(())
    }

    /// Copies between the kernel and a user buffer in kernel mode, under a
    /// user access record. With `store`, `data` is written to user memory;
    /// otherwise user memory is read into `data`.
    pub(crate) fn copy_user(
        &self,
        addr: usize,
        data: &mut [u8],
        store: bool,
    ) -> Result<(), AccessError> {
        let _access = self.begin_user_access(addr);
        let mut intr = InterruptFrame {
            eip: 0,
            eax: 0,
            esp: 0,
        };
        for (i, byte) in data.iter_mut().enumerate() {
            let value = store.then_some(*byte);
            *byte = self.access_byte(addr + i, value, false, &mut intr)?;
        }
        Ok(())
    }
}

pub struct ProcessTable {
    content: Mutex<BTreeMap<Pid, Arc<Process>>>,
    next_pid: AtomicPid,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            content: Mutex::new(BTreeMap::new()),
            next_pid: AtomicPid::new(1),
        }
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }

    /// Creates a process with a fresh address space drawing on `frames`.
    pub fn spawn(&self, name: &str, frames: Arc<FrameAllocator>, config: &VmConfig) -> Arc<Process> {
        let process = Arc::new(Process::new(self.allocate_pid(), name, frames, config));
        self.add(process.clone());
        process
    }

    pub fn add(&self, process: Arc<Process>) {
        let pid = process.pid();
        let mut content = self.content.lock();
        assert!(
            !content.contains_key(&pid),
            "process with pid {pid} already added to process table."
        );
        content.insert(pid, process);
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Process>> {
        self.content.lock().remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.content.lock().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.content.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use crate::logging::tests::global_console;
    use crate::mem::swapping::SECTORS_PER_SLOT;
    use kidneyos_shared::mem::OFFSET;
    use std::thread;

    const BASE: usize = 0x1000_0000;

    fn config(frames: usize) -> VmConfig {
        VmConfig {
            user_frames: frames,
            swap_sectors: (64 * SECTORS_PER_SLOT) as u32,
            ..VmConfig::default()
        }
    }

    #[test]
    fn exit_prints_and_releases() {
        let console = global_console();
        let config = config(4);
        let frames = Arc::new(FrameAllocator::with_ram_swap(&config));
        let table = ProcessTable::new();
        let process = table.spawn("exit-test", frames.clone(), &config);
        let file = Arc::new(TempFile::new(b"hello".to_vec()));

        process.setup_stack().unwrap();
        process.files().insert(FileHandle::open(file.clone()));
        process
            .space()
            .mmap(FileHandle::open(file.clone()), BASE)
            .unwrap();
        process.write_byte(BASE, b'j').unwrap();
        assert_eq!(file.open_count(), 2);

        process.exit(3);
        process.exit(4);
        assert_eq!(process.exit_status(), Some(3));
        assert!(console.contents().contains("[INFO  process] exit-test: exit(3)\n"));
        assert!(!console.contents().contains("exit-test: exit(4)"));

        assert_eq!(file.contents(), b"jello".to_vec());
        assert_eq!(file.open_count(), 0);
        assert_eq!(frames.frames_in_use(), 0);
        assert!(process.files().is_empty());
        assert_eq!(process.read_byte(BASE), Err(AccessError::Terminated));
    }

    #[test]
    fn stack_grows_on_push() {
        let config = config(4);
        let process = Process::new(
            1,
            "stack",
            Arc::new(FrameAllocator::with_ram_swap(&config)),
            &config,
        );
        process.setup_stack().unwrap();
        // Move the stack pointer to the bottom of the first page, then push.
        let esp = OFFSET - PAGE_FRAME_SIZE;
        process.set_user_esp(esp);
        process.write_bytes(esp - 4, &[1, 2, 3, 4]).unwrap();

        let mut back = [0u8; 4];
        process.read_bytes(esp - 4, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
        assert_eq!(process.space().spt().len(), 2);
        assert!(!process.is_terminated());
    }

    #[test]
    fn copy_user_redirects_on_bad_page() {
        let config = config(2);
        let process = Process::new(
            1,
            "copy",
            Arc::new(FrameAllocator::with_ram_swap(&config)),
            &config,
        );
        process.space().spt().install_zero(BASE, true).unwrap();

        let mut data = *b"abc";
        process.copy_user(BASE, &mut data, true).unwrap();
        let mut back = [0u8; 3];
        process.copy_user(BASE, &mut back, false).unwrap();
        assert_eq!(&back, b"abc");

        let mut data = [0u8; 2];
        assert_eq!(
            process.copy_user(BASE + PAGE_FRAME_SIZE - 1, &mut data, false),
            Err(AccessError::Redirected)
        );
        assert!(process.user_access().is_none());
        assert!(!process.is_terminated());
    }

    #[test]
    fn processes_share_the_frame_pool() {
        let config = config(3);
        let frames = Arc::new(FrameAllocator::with_ram_swap(&config));
        let table = Arc::new(ProcessTable::new());

        let workers: Vec<_> = (0..3u8)
            .map(|n| {
                let process = table.spawn("worker", frames.clone(), &config);
                thread::spawn(move || {
                    for page in 0..4 {
                        process
                            .space()
                            .spt()
                            .install_zero(BASE + page * PAGE_FRAME_SIZE, true)
                            .unwrap();
                    }
                    for round in 0..3u8 {
                        for page in 0..4 {
                            let addr = BASE + page * PAGE_FRAME_SIZE + usize::from(n);
                            process.write_byte(addr, n ^ round).unwrap();
                            assert_eq!(process.read_byte(addr), Ok(n ^ round));
                        }
                    }
                    for page in 0..4 {
                        let addr = BASE + page * PAGE_FRAME_SIZE + usize::from(n);
                        assert_eq!(process.read_byte(addr), Ok(n ^ 2));
                    }
                    process.exit(0);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(table.len(), 3);
        assert_eq!(frames.frames_in_use(), 0);
        assert_eq!(frames.swap_slots_in_use(), 0);
        assert!(frames.stats().evictions > 0);
    }

    #[test]
    fn pids_are_unique() {
        let table = ProcessTable::new();
        let config = config(1);
        let frames = Arc::new(FrameAllocator::with_ram_swap(&config));
        let a = table.spawn("a", frames.clone(), &config);
        let b = table.spawn("b", frames, &config);
        assert_ne!(a.pid(), b.pid());
        assert!(table.get(a.pid()).is_some());
        assert!(table.remove(a.pid()).is_some());
        assert!(table.get(a.pid()).is_none());
        assert_eq!(table.len(), 1);
    }
}
