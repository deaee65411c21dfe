use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide message id source.
///
/// Every handler draws from the same sequence, so ids are unique across
/// delivery patterns but carry no ordering meaning within one pattern.
/// Never reset during the process lifetime.
#[derive(Debug, Default)]
pub struct MessageSequence(AtomicU64);

impl MessageSequence {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Mint the next id. The first call returns 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last minted id, without minting. 0 before any mint.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
