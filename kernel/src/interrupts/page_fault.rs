//! Page fault resolution.
//!
//! A fault on a page that is not present is looked up in the faulting
//! process's supplemental page table and loaded, or, if it looks like a push
//! just below the stack pointer, the stack is grown by a page. Anything else
//! terminates the process, unless the fault came from kernel code probing
//! user memory, in which case the checked read is sent to its failure path.

use crate::fs::FsError;
use crate::mem::LoadError;
use crate::threading::process::Process;
use bitbybit::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kidneyos_shared::mem::is_user_vaddr;
use log::{debug, error};
use thiserror::Error;

/// Value left in `eax` when a checked user read is redirected.
pub const USER_READ_FAILED: usize = 0xffff_ffff;

static PAGE_FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of page faults handled since boot.
pub fn page_fault_count() -> u64 {
    PAGE_FAULT_COUNT.load(Ordering::Relaxed)
}

// https://wiki.osdev.org/Exceptions#Page_Fault
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    // Set for a protection violation, clear for a page that is not present.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

impl fmt::Debug for PageFaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFaultErrorCode")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .finish()
    }
}

/// What the CPU reports about a fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// Faulting address, from `cr2`.
    pub addr: usize,
    pub error_code: PageFaultErrorCode,
}

/// The registers of the interrupted context that fault handling reads or
/// rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptFrame {
    pub eip: usize,
    /// For a checked user read, the address to resume at if the access fails.
    pub eax: usize,
    pub esp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped now; retry the access.
    Resolved,
    /// A checked user read failed and `eip` now points at its failure path.
    Redirected,
    /// The process was killed.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("write to a read-only page")]
    ProtectionViolation,
    #[error("address is not in user space")]
    KernelAddress,
    #[error("no page at this address")]
    NoEntry,
    #[error("stack would grow past its limit")]
    StackLimit,
    #[error("loading the page failed: {0}")]
    Io(FsError),
}

impl From<LoadError> for FaultError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NoEntry => Self::NoEntry,
            LoadError::Io(err) => Self::Io(err),
        }
    }
}

/// Tries to make the faulting access succeed. `esp` is the user stack
/// pointer to judge stack growth by.
pub fn resolve(process: &Process, fault: &PageFault, esp: usize) -> Result<(), FaultError> {
    let addr = fault.addr;
    if fault.error_code.present() {
        return Err(FaultError::ProtectionViolation);
    }
    if !is_user_vaddr(addr) {
        return Err(FaultError::KernelAddress);
    }

    let space = process.space();
    match space.load_page(addr) {
        Err(LoadError::NoEntry) => {}
        other => return other.map_err(FaultError::from),
    }

    let policy = space.stack_policy();
    if policy.permits(addr, esp) {
        return space.grow_stack(addr).map_err(FaultError::from);
    }
    if addr < policy.stack_floor() && policy.is_push(addr, esp) {
        return Err(FaultError::StackLimit);
    }
    Err(FaultError::NoEntry)
}

/// Entry point from the trap dispatcher.
///
/// # Panics
///
/// Panics on a fault in kernel mode when the kernel was not accessing user
/// memory on behalf of `process`: that is a kernel bug.
pub fn handle_page_fault(
    process: &Process,
    fault: &PageFault,
    intr: &mut InterruptFrame,
) -> FaultOutcome {
    PAGE_FAULT_COUNT.fetch_add(1, Ordering::Relaxed);
    let user = fault.error_code.user();

    let esp = if user {
        intr.esp
    } else {
        let Some(access) = process.user_access() else {
            error!(
                "page fault at {:#x} in kernel context, eip {:#x}, error code {:#05b}",
                fault.addr,
                intr.eip,
                fault.error_code.raw_value()
            );
            panic!("kernel page fault at {:#x}", fault.addr);
        };
        access.esp
    };

    match resolve(process, fault, esp) {
        Ok(()) => FaultOutcome::Resolved,
        Err(err) if !user => {
            debug!(
                "pid {}: kernel access to {:#x} failed: {err}",
                process.pid(),
                fault.addr
            );
            intr.eip = intr.eax;
            intr.eax = USER_READ_FAILED;
            FaultOutcome::Redirected
        }
        Err(err) => {
            debug!(
                "pid {}: {} {} at {:#x} in user context: {err}",
                process.pid(),
                if fault.error_code.present() {
                    "rights violation"
                } else {
                    "not present"
                },
                if fault.error_code.write() {
                    "writing"
                } else {
                    "reading"
                },
                fault.addr
            );
            process.exit(-1);
            FaultOutcome::Terminated
        }
    }
}
