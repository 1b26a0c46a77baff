use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks which chunks of a download have been fetched and staged.
///
/// One bit per chunk index, packed into `u64` words. Marking is lock-free so
/// concurrent fetch tasks never contend on a shared mutex.
pub struct ChunkLedger {
    words: Box<[AtomicU64]>,
    total: u64,
    completed: AtomicU64,
}

impl ChunkLedger {
    /// Create an empty ledger for `total` chunks.
    pub fn new(total: u64) -> Self {
        let word_count = total.div_ceil(64) as usize;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            total,
            completed: AtomicU64::new(0),
        }
    }

    /// Mark a chunk as complete. Returns true if it was newly marked.
    pub fn mark(&self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let mask = 1u64 << (index % 64);
        let prev = self.words[(index / 64) as usize].fetch_or(mask, Ordering::AcqRel);
        if prev & mask != 0 {
            return false;
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        true
    }

    #[inline]
    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let mask = 1u64 << (index % 64);
        self.words[(index / 64) as usize].load(Ordering::Acquire) & mask != 0
    }

    #[inline]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed() >= self.total
    }

    /// Indices not yet marked, ascending.
    pub fn missing(&self) -> Vec<u64> {
        (0..self.total).filter(|&i| !self.is_set(i)).collect()
    }
}
