//! Bounded page FIFO between equipment and aggregation.
//!
//! Single producer (the readout thread), single consumer (the
//! aggregator). Lock-free, non-blocking on both ends: the producer
//! drops its iteration slot when full, the consumer polls.

use crossbeam_queue::ArrayQueue;
use flux_memory::PageRef;

/// Bounded lock-free FIFO of page handles.
pub struct PageFifo {
    q: ArrayQueue<PageRef>,
}

impl PageFifo {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            q: ArrayQueue::new(capacity),
        }
    }

    /// Non-blocking push; hands the page back when full.
    #[inline]
    pub fn push(&self, page: PageRef) -> Result<(), PageRef> {
        self.q.push(page)
    }

    /// Non-blocking pop.
    #[inline]
    pub fn pop(&self) -> Option<PageRef> {
        self.q.pop()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.q.is_full()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.q.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.q.capacity()
    }

    /// Free slots.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.q.capacity() - self.q.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flux_memory::{MemoryBank, MemoryBankManager};

    #[test]
    fn bounded_push_pop() {
        let manager = MemoryBankManager::new();
        manager
            .add_bank(Arc::new(MemoryBank::new_owned("f", 64 * 1024).unwrap()))
            .unwrap();
        let pool = manager.get_paged_pool(4096, 4, "f", 0, 0).unwrap();

        let fifo = PageFifo::new(2);
        assert!(fifo.is_empty());

        fifo.push(pool.acquire().unwrap()).unwrap();
        fifo.push(pool.acquire().unwrap()).unwrap();
        assert!(fifo.is_full());
        assert_eq!(fifo.free_slots(), 0);

        // full: page comes back to the caller
        let extra = pool.acquire().unwrap();
        let back = fifo.push(extra).unwrap_err();
        drop(back);

        assert!(fifo.pop().is_some());
        assert_eq!(fifo.len(), 1);
        assert!(fifo.pop().is_some());
        assert!(fifo.pop().is_none());
    }
}
