//! Record-count limited chunk buffer.

use std::cmp::Ordering;

use rayon;
use rayon::slice::ParallelSliceMut;

/// In-memory chunk of records limited by the number of records that fit into the memory budget.
pub struct ChunkBuffer<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> ChunkBuffer<T> {
    /// Creates an empty buffer able to hold `limit` records.
    /// Memory for the whole chunk is allocated up front.
    pub fn new(limit: usize) -> Self {
        ChunkBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }

    /// Adds a new record to the buffer.
    pub fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    /// Returns buffer length
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }
}

impl<T: Send> ChunkBuffer<T> {
    /// Sorts the buffer in parallel on the given pool.
    /// The sort is stable: records comparing equal keep their arrival order.
    pub fn sort_by<F>(&mut self, thread_pool: &rayon::ThreadPool, compare: F)
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        thread_pool.install(|| {
            self.par_sort_by(compare);
        });
    }
}

impl<T> IntoIterator for ChunkBuffer<T> {
    type Item = T;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<T: Send> rayon::slice::ParallelSliceMut<T> for ChunkBuffer<T> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}
