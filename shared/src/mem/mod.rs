use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// grow down from here.
pub const OFFSET: usize = 0x80000000;

/// Largest size a user stack may grow to.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// Number of frames handed out to user pages when no other size is given.
pub const DEFAULT_USER_FRAMES: usize = 256;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Returns the page-aligned addresses of every page touched by the byte
/// range `[start, start + len)`. An empty range touches no pages.
pub fn pages_spanned(start: usize, len: usize) -> impl Iterator<Item = usize> {
    let first = page_round_down(start);
    let end = if len == 0 {
        first
    } else {
        page_round_down(start.saturating_add(len - 1)) + PAGE_FRAME_SIZE
    };
    (first..end).step_by(PAGE_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x8000));
        assert!(!is_page_aligned(0x8001));
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
    }

    #[test]
    fn spanned_pages() {
        let mut pages = pages_spanned(0x1ffe, 4);
        assert_eq!(pages.next(), Some(0x1000));
        assert_eq!(pages.next(), Some(0x2000));
        assert_eq!(pages.next(), None);

        assert_eq!(pages_spanned(0x3000, PAGE_FRAME_SIZE).count(), 1);
        assert_eq!(pages_spanned(0x3000, 0).count(), 0);
    }
}
