//! Per-engine sequence number allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation identifier pairing a call with its reply.
pub type Seq = u64;

/// Issues strictly increasing sequence numbers starting at 0.
///
/// Allocation is a single atomic increment, so concurrent callers never
/// receive the same number.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering at `base` instead of 0.
    pub fn starting_at(base: Seq) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub fn next(&self) -> Seq {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The number the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> Seq {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero_and_increments() {
        let seq = SequenceAllocator::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn test_custom_base() {
        let seq = SequenceAllocator::starting_at(100);
        assert_eq!(seq.next(), 100);
        assert_eq!(seq.next(), 101);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let seq = Arc::new(SequenceAllocator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in threads {
            for n in handle.join().unwrap() {
                assert!(seen.insert(n), "sequence {} issued twice", n);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(seq.peek(), 8000);
    }
}
