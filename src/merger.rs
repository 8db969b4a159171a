//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Head record of one merge source.
///
/// Entries are ordered by record first and by source index second, so records with equal keys
/// are taken from the source listed first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct FrontierEntry<T> {
    head: T,
    source: usize,
    position: u64,
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<FrontierEntry<T>>>,
    chunks: Vec<C::IntoIter>,
    initiated: bool,
    failed: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    /// Among equal items the one from the chunk that comes first in `chunks` is returned first.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            initiated: false,
            failed: false,
        };
    }

    /// Number of sources that still have records in the frontier.
    pub fn active_sources(&self) -> usize {
        self.items.len()
    }

    fn advance(&mut self, source: usize, position: u64) -> Result<(), E> {
        if let Some(item) = self.chunks[source].next() {
            self.items.push(Reverse(FrontierEntry {
                head: item?,
                source,
                position,
            }));
        }

        return Ok(());
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    /// After an input error is returned the merger yields nothing more.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if !self.initiated {
            self.initiated = true;
            for source in 0..self.chunks.len() {
                if let Err(err) = self.advance(source, 0) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }

        let Reverse(entry) = self.items.pop()?;
        if let Err(err) = self.advance(entry.source, entry.position + 1) {
            self.failed = true;
            return Some(Err(err));
        }

        return Some(Ok(entry.head));
    }
}
