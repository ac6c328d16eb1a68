//! Virtual memory for KidneyOS user processes: demand paging, frame
//! eviction, swap and memory-mapped files.
//!
//! The subsystem is built around one shared [`mem::FrameAllocator`] handle
//! that owns physical frames, the reverse frame map and the swap device.
//! Every [`threading::process::Process`] owns an address space made of a
//! supplemental page table, a hardware page directory and its mmap regions.
//! Page faults enter through [`interrupts::page_fault`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod logging;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod threading;
pub mod user_program;
