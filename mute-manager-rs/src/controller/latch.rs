//! Scoped "update in progress" guard.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Marks a fan-out write in progress.
///
/// Entering returns a [`LatchGuard`]; the latch stays held until every guard
/// is dropped, including when the holder unwinds from a panic. Nested entries
/// from the same write path are counted.
#[derive(Debug, Default)]
pub struct UpdateLatch {
    depth: AtomicUsize,
}

impl UpdateLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> LatchGuard<'_> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        LatchGuard { latch: self }
    }

    pub fn is_held(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }
}

#[must_use = "the latch is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a UpdateLatch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.depth.fetch_sub(1, Ordering::SeqCst);
    }
}
