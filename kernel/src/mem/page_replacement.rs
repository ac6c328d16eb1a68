//! Victim selection for eviction.

/// What the frame table knows about a frame when the policy asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    /// Free, pinned, held by the kernel, or its page is pinned.
    Skip,
    /// Used since the hand last passed; its accessed bit has now been cleared.
    Referenced,
    Evictable,
}

pub trait PageReplacementPolicy: Default {
    /// Picks a frame to evict out of `frames` frames, classifying each with
    /// `inspect`. Returns [`None`] when no frame can be evicted.
    fn select_victim(
        &mut self,
        frames: usize,
        inspect: impl FnMut(usize) -> Candidate,
    ) -> Option<usize>;
}

/// Second-chance clock over the hardware accessed bits.
#[derive(Default)]
pub struct Clock {
    hand: usize,
}

impl PageReplacementPolicy for Clock {
    fn select_victim(
        &mut self,
        frames: usize,
        mut inspect: impl FnMut(usize) -> Candidate,
    ) -> Option<usize> {
        if frames == 0 {
            return None;
        }
        // Two sweeps: the first may only clear accessed bits.
        for _ in 0..2 * frames {
            let frame = self.hand % frames;
            self.hand = (frame + 1) % frames;
            if inspect(frame) == Candidate::Evictable {
                return Some(frame);
            }
        }
        None
    }
}
