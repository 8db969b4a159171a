//! External quicksort.
//!
//! The input is split around `arity - 1` pivots into at most `arity` partitions, each partition
//! is split again until it fits into the memory budget, and the sorted partitions are appended
//! to the output in pivot order. Pivots are drawn by reservoir sampling over the partition being
//! split, so every partitioning level reads its data twice and writes it once. A partition that
//! did not shrink (all of its records fell between the same two pivots) is sorted by merge
//! passes instead of being split again.

use std::io;
use std::path::Path;

use log;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::ChunkBuffer;
use crate::codec::RecordCodec;
use crate::io_stats::IoStats;
use crate::run::{RunArena, RunId};
use crate::sort::{ExternalSorter, SortError, SortOutcome};
use crate::stream::{PageLayout, RecordReader, RecordWriter};

/// Records per partition page: one input page, `arity` output pages and `arity - 1` pivots
/// share the `chunk_capacity` record slots of the budget. At least one record.
pub fn partition_page_records(chunk_capacity: usize, arity: usize) -> usize {
    let pivots = arity.saturating_sub(1);
    return (chunk_capacity.saturating_sub(pivots) / (arity + 1)).max(1);
}

pub(crate) struct ExternalQuicksort<'a, T, C: RecordCodec<T>> {
    sorter: &'a ExternalSorter<T, C>,
    arity: usize,
    stats: &'a IoStats,
    rng: StdRng,
    /// Deepest partitioning level reached.
    levels: usize,
    /// Partitions sorted in memory or by merge passes.
    leaves: usize,
}

impl<'a, T, C> ExternalQuicksort<'a, T, C>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    pub fn new(sorter: &'a ExternalSorter<T, C>, arity: usize, stats: &'a IoStats) -> Self {
        ExternalQuicksort {
            sorter,
            arity,
            stats,
            rng: StdRng::seed_from_u64(sorter.pivot_seed()),
            levels: 0,
            leaves: 0,
        }
    }

    /// Sorts `input` into a single run registered in the arena.
    pub fn sort(mut self, input: &Path, arena: &mut RunArena) -> Result<SortOutcome, SortError> {
        let pending = arena.allocate().map_err(SortError::TempDir)?;
        let mut output = RecordWriter::create(
            pending.path(),
            PageLayout::direct(self.sorter.chunk_capacity()),
            self.sorter.codec().clone(),
            self.stats.clone(),
        )
        .map_err(SortError::IO)?;

        let records = self.sort_part(arena, input, None, 0, &mut output)?;
        let len = output.finish().map_err(SortError::IO)?;
        let run = arena.register(pending, len);

        log::debug!(
            "quicksort: {} records, {} partitions, {} levels",
            records,
            self.leaves,
            self.levels
        );

        return Ok(SortOutcome {
            run: Some(run),
            records,
            initial_runs: self.leaves,
            passes: self.levels,
        });
    }

    fn layout(&self) -> PageLayout {
        let page_records = partition_page_records(self.sorter.chunk_capacity(), self.arity);
        return PageLayout::buffered(page_records, self.sorter.record_size());
    }

    /// Appends the sorted records of `part` to `output` and returns their number.
    fn sort_part(
        &mut self,
        arena: &mut RunArena,
        part: &Path,
        len: Option<u64>,
        depth: usize,
        output: &mut RecordWriter<T, C>,
    ) -> Result<u64, SortError> {
        let capacity = self.sorter.chunk_capacity() as u64;
        if let Some(len) = len {
            if len <= capacity {
                self.sort_in_memory(part, len, output)?;
                return Ok(len);
            }
        }

        let (pivots, len) = self.sample_pivots(part, len).map_err(SortError::IO)?;
        if len <= capacity {
            self.sort_in_memory(part, len, output)?;
            return Ok(len);
        }

        self.levels = self.levels.max(depth + 1);
        let parts = self.partition(arena, part, len, &pivots)?;
        drop(pivots);

        for (id, part_len) in parts {
            let path = arena.get(id).ok_or_else(|| SortError::missing_run(id))?.path().to_path_buf();
            if part_len == len {
                log::trace!("{} did not shrink, sorting it by merge passes", id);
                self.merge_part(arena, &path, output)?;
            } else {
                self.sort_part(arena, &path, Some(part_len), depth + 1, output)?;
            }
            arena.retire(id).map_err(SortError::IO)?;
        }

        return Ok(len);
    }

    /// Draws up to `arity - 1` distinct pivots uniformly from `part`.
    /// Returns them sorted together with the number of records in `part`.
    fn sample_pivots(&mut self, part: &Path, len: Option<u64>) -> io::Result<(Vec<T>, u64)> {
        let mut reader = RecordReader::open(part, self.layout(), self.sorter.codec().clone(), self.stats.clone())?;
        if let Some(len) = len {
            reader = reader.with_expected_records(len);
        }

        let wanted = self.arity - 1;
        let mut sample = Vec::with_capacity(wanted);
        let mut seen: u64 = 0;
        while let Some(item) = reader.read_record()? {
            if sample.len() < wanted {
                sample.push(item);
            } else {
                let slot = self.rng.gen_range(0..=seen);
                if slot < wanted as u64 {
                    sample[slot as usize] = item;
                }
            }
            seen += 1;
        }

        sample.sort();
        sample.dedup();

        return Ok((sample, seen));
    }

    /// Splits `part` into `pivots.len() + 1` runs, the i-th run holding the records greater than
    /// pivot `i - 1` and not greater than pivot `i`. Empty runs are dropped.
    fn partition(
        &mut self,
        arena: &mut RunArena,
        part: &Path,
        len: u64,
        pivots: &[T],
    ) -> Result<Vec<(RunId, u64)>, SortError> {
        let layout = self.layout();
        log::trace!(
            "partitioning {} records around {} pivots (page: {} records)",
            len,
            pivots.len(),
            layout.records()
        );

        let mut outputs = Vec::with_capacity(pivots.len() + 1);
        for _ in 0..=pivots.len() {
            let pending = arena.allocate().map_err(SortError::TempDir)?;
            let writer = RecordWriter::create(pending.path(), layout, self.sorter.codec().clone(), self.stats.clone())
                .map_err(SortError::IO)?;
            outputs.push((pending, writer));
        }

        let mut reader = RecordReader::open(part, layout, self.sorter.codec().clone(), self.stats.clone())
            .map_err(SortError::IO)?
            .with_expected_records(len);
        while let Some(item) = reader.read_record().map_err(SortError::IO)? {
            let idx = pivots.partition_point(|pivot| pivot < &item);
            outputs[idx].1.write_record(item).map_err(SortError::IO)?;
        }

        let mut parts = Vec::with_capacity(outputs.len());
        for (pending, writer) in outputs {
            let part_len = writer.finish().map_err(SortError::IO)?;
            let id = arena.register(pending, part_len);
            if part_len == 0 {
                arena.retire(id).map_err(SortError::IO)?;
            } else {
                parts.push((id, part_len));
            }
        }

        return Ok(parts);
    }

    fn sort_in_memory(&mut self, part: &Path, len: u64, output: &mut RecordWriter<T, C>) -> Result<(), SortError> {
        let capacity = self.sorter.chunk_capacity();
        let layout = PageLayout::direct(capacity);
        let mut reader = RecordReader::open(part, layout, self.sorter.codec().clone(), self.stats.clone())
            .map_err(SortError::IO)?
            .with_expected_records(len);

        let mut chunk = ChunkBuffer::new(len as usize);
        while let Some(item) = reader.read_record().map_err(SortError::IO)? {
            chunk.push(item);
        }

        log::trace!("sorting partition in memory ({} records)", chunk.len());
        chunk.sort_by(self.sorter.thread_pool(), T::cmp);
        output.write_all(chunk).map_err(SortError::IO)?;
        self.leaves += 1;

        return Ok(());
    }

    fn merge_part(
        &mut self,
        arena: &mut RunArena,
        part: &Path,
        output: &mut RecordWriter<T, C>,
    ) -> Result<(), SortError> {
        let outcome = self.sorter.merge_sort(part, arena, self.arity, self.stats)?;
        self.leaves += outcome.initial_runs;

        let id = match outcome.run {
            Some(id) => id,
            None => return Ok(()),
        };
        let run = arena.get(id).ok_or_else(|| SortError::missing_run(id))?;

        let reader = RecordReader::open(run.path(), self.layout(), self.sorter.codec().clone(), self.stats.clone())
            .map_err(|err| SortError::MergeFailure { run: id, source: err })?
            .with_expected_records(run.len());
        for item in reader {
            let item = item.map_err(|err| SortError::MergeFailure { run: id, source: err })?;
            output.write_record(item).map_err(SortError::IO)?;
        }

        return arena.retire(id).map_err(SortError::IO);
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::partition_page_records;
    use crate::codec::{FixedCodec, RmpCodec};
    use crate::sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortMethod};
    use crate::stream::{read_records, write_records};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn fixed_sorter(tmp_dir: &Path, memory_budget: u64) -> ExternalSorter<i64, FixedCodec<i64>> {
        ExternalSorterBuilder::new()
            .with_memory_budget(memory_budget)
            .with_threads_number(2)
            .with_pivot_seed(7)
            .with_tmp_dir(tmp_dir)
            .build()
            .unwrap()
    }

    fn write_input(tmp_dir: &Path, items: Vec<i64>) -> PathBuf {
        let path = tmp_dir.join("input.bin");
        write_records(&path, items, FixedCodec::default()).unwrap();
        return path;
    }

    #[rstest]
    #[case(32, 2, 10)]
    #[case(32, 4, 5)]
    #[case(32, 31, 1)]
    #[case(1, 2, 1)]
    #[case(1000, 7, 124)]
    fn test_partition_page_records(#[case] chunk_capacity: usize, #[case] arity: usize, #[case] expected: usize) {
        assert_eq!(partition_page_records(chunk_capacity, arity), expected);
    }

    #[rstest]
    #[case(1000, 256, 4)]
    #[case(1000, 256, 2)]
    #[case(1000, 256, 31)]
    #[case(777, 96, 3)]
    #[case(100, 8000, 2)]
    #[case(1, 64, 2)]
    #[case(0, 64, 2)]
    fn test_external_quicksort(
        tmp_dir: tempfile::TempDir,
        #[case] records: i64,
        #[case] memory_budget: u64,
        #[case] arity: usize,
    ) {
        let mut items = Vec::from_iter(0..records);
        items.shuffle(&mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), items);
        let output = tmp_dir.path().join("output.bin");
        let sorter = fixed_sorter(tmp_dir.path(), memory_budget);

        let report = sorter.quicksort_file(&input, &output, arity).unwrap();

        let actual_result: Vec<i64> = read_records(&output, FixedCodec::default()).unwrap();
        assert_eq!(actual_result, Vec::from_iter(0..records));
        assert_eq!(report.method, SortMethod::Quicksort);
        assert_eq!(report.records, records as u64);
        assert_eq!(report.arity, arity);

        if records as u64 <= memory_budget / 8 {
            assert_eq!(report.passes, 0);
        } else {
            assert!(report.passes >= 1);
            assert!(report.initial_runs >= 2);
        }
    }

    #[rstest]
    fn test_quicksort_with_duplicates(tmp_dir: tempfile::TempDir) {
        let mut items: Vec<i64> = (0..600).map(|i| i % 3).collect();
        items.extend(vec![5; 200]);
        items.shuffle(&mut rand::thread_rng());
        let input = write_input(tmp_dir.path(), items.clone());
        let output = tmp_dir.path().join("output.bin");
        let sorter = fixed_sorter(tmp_dir.path(), 256);

        sorter.quicksort_file(&input, &output, 4).unwrap();

        items.sort();
        let actual_result: Vec<i64> = read_records(&output, FixedCodec::default()).unwrap();
        assert_eq!(actual_result, items);
    }

    #[rstest]
    fn test_quicksort_of_equal_records(tmp_dir: tempfile::TempDir) {
        let input = write_input(tmp_dir.path(), vec![42; 500]);
        let output = tmp_dir.path().join("output.bin");
        let sorter = fixed_sorter(tmp_dir.path(), 128);

        let report = sorter.quicksort_file(&input, &output, 3).unwrap();

        let actual_result: Vec<i64> = read_records(&output, FixedCodec::default()).unwrap();
        assert_eq!(actual_result, vec![42; 500]);
        assert_eq!(report.passes, 1);
        assert_eq!(report.initial_runs, 32);
    }

    #[rstest]
    fn test_quicksort_of_sorted_input(tmp_dir: tempfile::TempDir) {
        let input = write_input(tmp_dir.path(), Vec::from_iter(0..2000));
        let output = tmp_dir.path().join("output.bin");
        let sorter = fixed_sorter(tmp_dir.path(), 512);

        let first = sorter.quicksort_file(&input, &output, 8).unwrap();
        let second = sorter.quicksort_file(&input, &output, 8).unwrap();

        let actual_result: Vec<i64> = read_records(&output, FixedCodec::default()).unwrap();
        assert_eq!(actual_result, Vec::from_iter(0..2000));
        assert_eq!(first.disk_io(), second.disk_io());
        assert!(first.disk_reads > 0 && first.disk_writes > 0);
    }

    #[rstest]
    fn test_quicksort_rmp_records(tmp_dir: tempfile::TempDir) {
        let mut items: Vec<String> = (0..300).map(|i| format!("item-{:04}", i)).collect();
        items.shuffle(&mut rand::thread_rng());
        let input = tmp_dir.path().join("input.bin");
        write_records(&input, items.clone(), RmpCodec::default()).unwrap();

        let sorter: ExternalSorter<String> = ExternalSorterBuilder::new()
            .with_memory_budget(16 * 40)
            .with_record_size(16)
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();
        let output = tmp_dir.path().join("output.bin");
        sorter.quicksort_file(&input, &output, 5).unwrap();

        items.sort();
        let actual_result: Vec<String> = read_records(&output, RmpCodec::default()).unwrap();
        assert_eq!(actual_result, items);
    }

    #[rstest]
    fn test_quicksort_failure_keeps_output_untouched(tmp_dir: tempfile::TempDir) {
        let sorter = fixed_sorter(tmp_dir.path(), 256);
        let output = tmp_dir.path().join("output.bin");
        fs::write(&output, b"previous").unwrap();

        let result = sorter.quicksort_file(&tmp_dir.path().join("missing.bin"), &output, 2);
        assert!(matches!(result, Err(SortError::IO(_))));

        let result = sorter.quicksort_file(&tmp_dir.path().join("missing.bin"), &output, 40);
        assert!(matches!(result, Err(SortError::Config(_))));
        assert_eq!(fs::read(&output).unwrap(), b"previous");
    }
}
