//! Runtime policy for the VM subsystem.
//!
//! Fixed geometry (page size, where user space ends) lives in
//! [`kidneyos_shared::mem`]; everything here can differ between boots or
//! between targets and is handed to the frame allocator and to each address
//! space explicitly.

use alloc::{vec, vec::Vec};
use kidneyos_shared::{
    mem::{DEFAULT_USER_FRAMES, MAX_STACK_SIZE, OFFSET},
    sizes::SWAP_SECTORS,
};

/// Decides whether a fault with no supplemental entry is a stack push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackGrowthPolicy {
    /// The stack may cover `[OFFSET - max_stack_size, OFFSET)`.
    pub max_stack_size: usize,
    /// Distances below the stack pointer that still count as a push.
    ///
    /// x86 `push` faults 4 bytes below `esp` and `pusha` 32 bytes below, both
    /// before `esp` itself has moved.
    pub push_slack: Vec<usize>,
}

impl StackGrowthPolicy {
    /// Lowest address the stack may ever cover.
    pub fn stack_floor(&self) -> usize {
        OFFSET.saturating_sub(self.max_stack_size)
    }

    /// Whether `fault_addr` is at or above `esp`, or exactly one of the
    /// accepted distances below it.
    pub fn is_push(&self, fault_addr: usize, esp: usize) -> bool {
        fault_addr >= esp
            || self
                .push_slack
                .iter()
                .any(|&slack| esp.checked_sub(slack) == Some(fault_addr))
    }

    /// Whether a fault at `fault_addr` with stack pointer `esp` should grow
    /// the stack.
    pub fn permits(&self, fault_addr: usize, esp: usize) -> bool {
        if fault_addr < self.stack_floor() || fault_addr >= OFFSET {
            return false;
        }
        self.is_push(fault_addr, esp)
    }
}

impl Default for StackGrowthPolicy {
    fn default() -> Self {
        Self {
            max_stack_size: MAX_STACK_SIZE,
            push_slack: vec![4, 32],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames available to user pages.
    pub user_frames: usize,
    /// Size of the swap device in sectors, used when the kernel creates the
    /// swap device itself.
    pub swap_sectors: u32,
    pub stack: StackGrowthPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            swap_sectors: SWAP_SECTORS,
            stack: StackGrowthPolicy::default(),
        }
    }
}
