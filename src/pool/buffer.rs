//! Size-classed pool of packet buffers shared by all connections.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::config::BufferPoolConfig;

/// One power-of-two size class
#[derive(Debug)]
struct SizeClass {
    size: usize,
    free: ArrayQueue<Vec<u8>>,
}

/// Counters describing pool effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Borrows served from a free list
    pub hits: u64,
    /// Borrows that allocated a new pooled-size buffer
    pub misses: u64,
    /// Borrows above the largest class, allocated directly
    pub oversized: u64,
    /// Returned buffers that were dropped (full class or unpoolable size)
    pub dropped: u64,
}

/// Buffer pool for reusing packet buffers across connections.
///
/// `get(n)` returns a buffer whose length is exactly `n` and whose capacity
/// is the smallest class that fits. Requests above the largest class are
/// allocated directly and never retained. Safe for concurrent use from any
/// task.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<SizeClass>,
    hits: AtomicU64,
    misses: AtomicU64,
    oversized: AtomicU64,
    dropped: AtomicU64,
}

impl BufferPool {
    pub fn new(config: &BufferPoolConfig) -> Self {
        let min_size = config.min_size.max(1).next_power_of_two();
        let retained = config.max_retained_per_class.max(1);

        let mut classes = Vec::new();
        let mut size = min_size;
        while size <= config.max_size {
            classes.push(SizeClass {
                size,
                free: ArrayQueue::new(retained),
            });
            size *= 2;
        }

        Self {
            classes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Largest request size that is served from the pool
    pub fn max_pooled_size(&self) -> usize {
        self.classes.last().map(|c| c.size).unwrap_or(0)
    }

    /// Borrow a zero-filled buffer of exactly `size` bytes
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some(class) = self.classes.iter().find(|c| c.size >= size) else {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            return vec![0; size];
        };

        match class.free.pop() {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut buf = Vec::with_capacity(class.size);
                buf.resize(size, 0);
                buf
            }
        }
    }

    /// Return a buffer. Buffers that do not fit any class are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        if capacity > self.max_pooled_size() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Largest class this buffer can still serve
        let Some(class) = self.classes.iter().rev().find(|c| c.size <= capacity) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if class.free.push(buf).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&BufferPoolConfig::default())
    }
}
