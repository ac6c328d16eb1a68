//! Kernel mutex.
//!
//! With the `ticket_mutex` feature (the default) this is a FIFO ticket lock:
//! the context that started waiting first gets the lock first, so a page
//! fault stuck behind the frame allocator cannot be starved by later ones.
//! Without it a plain test-and-set spinlock is used.
//!
//! Every lock in the VM subsystem is one of these. They are always taken in
//! this order:
//!
//! 1. the frame allocator's global table lock,
//! 2. a supplemental page table entry lock,
//! 3. a page directory lock,
//! 4. a frame's contents lock.
//!
//! The one exception is a fault loading a page that is not resident: it holds
//! that page's entry lock while it asks the allocator for a frame. The
//! evictor only ever locks entries of resident pages, so the two never meet.
//!
//! The table-wide lock of a supplemental page table is only held for
//! insert, remove and lookup and is never held while taking any other lock.

#[cfg(feature = "ticket_mutex")]
pub use spin::mutex::{TicketMutex as Mutex, TicketMutexGuard as MutexGuard};

#[cfg(not(feature = "ticket_mutex"))]
pub use spin::mutex::{SpinMutex as Mutex, SpinMutexGuard as MutexGuard};
