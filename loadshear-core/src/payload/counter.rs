//! Per-payload, per-counter-op atomic state, shared read-write across every shard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line padded so that two counters backing different payloads never false-share,
/// even though every shard thread is fetch-adding its own counter concurrently.
#[repr(align(64))]
#[derive(Debug)]
pub struct PayloadCounter {
    value: AtomicU64,
    step: u16,
}

impl PayloadCounter {
    /// `step` of 0 is rejected by the verifier before any counter is constructed.
    pub fn new(step: u16) -> Self {
        PayloadCounter {
            value: AtomicU64::new(0),
            step,
        }
    }

    pub fn step(&self) -> u16 {
        self.step
    }

    /// Fetch-adds `step` and returns the value observed before the add. The first call
    /// observes 0; overflow wraps silently, matching the spec's counter semantics.
    #[inline]
    pub fn fetch_next(&self) -> u64 {
        self.value.fetch_add(self.step as u64, Ordering::Relaxed)
    }

    /// Non-mutating peek, used by tests and metrics display only.
    #[inline]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fetch_is_zero() {
        let counter = PayloadCounter::new(5);
        assert_eq!(counter.fetch_next(), 0);
        assert_eq!(counter.fetch_next(), 5);
        assert_eq!(counter.fetch_next(), 10);
    }

    #[test]
    fn step_is_preserved() {
        let counter = PayloadCounter::new(7);
        assert_eq!(counter.step(), 7);
    }
}
