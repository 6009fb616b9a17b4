//! Fixed-capacity batch pool.
//!
//! Pre-allocates batches of a single capacity so the submit path never hits
//! the allocator; released batches are cleared and reused.

use std::sync::Mutex;

use crate::record::Batch;

/// Pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_created: usize,
    pub available: usize,
    pub in_use: usize,
}

struct PoolInner {
    free: Vec<Batch>,
    total_created: usize,
    in_use: usize,
}

/// Thread-safe pool of equally sized batches.
pub struct BatchPool {
    batch_capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BatchPool {
    /// Create a pool whose batches hold `batch_capacity` records each,
    /// pre-allocating `initial_batches` of them.
    pub fn new(batch_capacity: usize, initial_batches: usize) -> Self {
        let free: Vec<Batch> = (0..initial_batches)
            .map(|_| Batch::with_capacity(batch_capacity))
            .collect();
        BatchPool {
            batch_capacity,
            inner: Mutex::new(PoolInner {
                total_created: free.len(),
                in_use: 0,
                free,
            }),
        }
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Take a cleared batch, growing the pool when empty.
    pub fn create_batch(&self) -> Batch {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use += 1;
        match inner.free.pop() {
            Some(batch) => batch,
            None => {
                inner.total_created += 1;
                Batch::with_capacity(self.batch_capacity)
            }
        }
    }

    /// Return a batch for reuse. Batches of a foreign capacity are dropped
    /// rather than mixed into the pool.
    pub fn free_batch(&self, mut batch: Batch) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use = inner.in_use.saturating_sub(1);
        if batch.capacity() == self.batch_capacity {
            batch.clear();
            inner.free.push(batch);
        } else {
            inner.total_created = inner.total_created.saturating_sub(1);
        }
    }

    /// Pre-allocate `additional` more batches.
    pub fn expand(&self, additional: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..additional {
            inner.free.push(Batch::with_capacity(self.batch_capacity));
        }
        inner.total_created += additional;
    }

    pub fn statistics(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            total_created: inner.total_created,
            available: inner.free.len(),
            in_use: inner.in_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn batches_come_back_cleared_and_reused() {
        let pool = BatchPool::new(8, 1);
        let mut batch = pool.create_batch();
        batch.set_batch_id(7);
        batch.push(Record::new(1, "a", 1.0, 1));
        pool.free_batch(batch);

        let batch = pool.create_batch();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.batch_id(), 0);
        assert_eq!(batch.capacity(), 8);
        assert_eq!(pool.statistics().total_created, 1, "the batch was reused");
    }

    #[test]
    fn pool_grows_on_demand() {
        let pool = BatchPool::new(4, 1);
        let first = pool.create_batch();
        let second = pool.create_batch();
        let stats = pool.statistics();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.available, 0);

        pool.free_batch(first);
        pool.free_batch(second);
        let stats = pool.statistics();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn expand_preallocates() {
        let pool = BatchPool::new(4, 0);
        pool.expand(3);
        let stats = pool.statistics();
        assert_eq!(stats.total_created, 3);
        assert_eq!(stats.available, 3);
    }

    #[test]
    fn foreign_capacity_batches_are_not_pooled() {
        let pool = BatchPool::new(4, 0);
        let _ = pool.create_batch();
        pool.free_batch(Batch::with_capacity(99));
        assert_eq!(pool.statistics().available, 0);
    }
}
