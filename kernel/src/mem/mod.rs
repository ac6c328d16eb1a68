//! Virtual memory: supplemental page tables, the shared frame pool with
//! eviction, swap, memory-mapped files and the helpers the syscall layer uses
//! to touch user memory safely.

pub mod address_space;
pub mod frame_allocator;
pub mod page_replacement;
pub mod page_table;
pub mod swapping;
pub mod user;
pub mod vma;

pub use address_space::{AddressSpace, LoadError};
pub use frame_allocator::{AllocFlags, Frame, FrameAllocator, FrameStats};
pub use page_table::{PageStatus, SupplementalPageTable};
pub use swapping::{SwapSlot, SwapStore};
