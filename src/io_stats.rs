//! Page-level disk I/O accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Disk read/write counters shared by every stream of one sorter invocation.
///
/// Clones share the same counters, so merge workers running on different threads
/// update a single total. Counters are incremented once per page, never per record.
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

/// Point-in-time copy of [`IoStats`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSnapshot {
    pub reads: u64,
    pub writes: u64,
}

impl IoSnapshot {
    /// Total page accesses.
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

impl IoStats {
    pub fn new() -> Self {
        IoStats::default()
    }

    pub fn add_read(&self, pages: u64) {
        self.reads.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn add_write(&self, pages: u64) {
        self.writes.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            reads: self.reads(),
            writes: self.writes(),
        }
    }

    /// Zeroes both counters. Called at the start of every sorter invocation.
    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::{IoSnapshot, IoStats};

    #[test]
    fn test_io_stats_shared_between_clones() {
        let stats = IoStats::new();
        let clone = stats.clone();

        stats.add_read(2);
        clone.add_write(3);

        assert_eq!(stats.snapshot(), IoSnapshot { reads: 2, writes: 3 });
        assert_eq!(clone.snapshot().total(), 5);

        clone.reset();
        assert_eq!(stats.snapshot(), IoSnapshot::default());
    }

    #[test]
    fn test_io_stats_concurrent_updates() {
        let stats = IoStats::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_read(1);
                        stats.add_write(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.reads(), 4000);
        assert_eq!(stats.writes(), 4000);
    }
}
