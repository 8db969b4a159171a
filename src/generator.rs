//! Initial run generation.

use std::cmp::Ordering;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use log;

use crate::buffer::ChunkBuffer;
use crate::codec::RecordCodec;
use crate::io_stats::IoStats;
use crate::run::{RunArena, RunId};
use crate::stream::{PageLayout, RecordReader, RecordWriter};

/// Result of the run generation phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedRuns {
    /// Initial runs in input order.
    pub runs: Vec<RunId>,
    /// Number of records consumed from the input.
    pub records: u64,
}

/// Splits an unsorted input into sorted runs of at most `chunk_capacity` records.
///
/// The input is read one page of `chunk_capacity` records at a time straight into the chunk,
/// the chunk is sorted in memory and written out as a new run. Equal records keep their input order.
pub struct RunGenerator<'a, T, C: RecordCodec<T>> {
    chunk_capacity: usize,
    codec: &'a C,
    stats: &'a IoStats,
    thread_pool: &'a rayon::ThreadPool,

    item_type: PhantomData<T>,
}

impl<'a, T, C> RunGenerator<'a, T, C>
where
    T: Send,
    C: RecordCodec<T>,
{
    pub fn new(chunk_capacity: usize, codec: &'a C, stats: &'a IoStats, thread_pool: &'a rayon::ThreadPool) -> Self {
        RunGenerator {
            chunk_capacity: chunk_capacity.max(1),
            codec,
            stats,
            thread_pool,
            item_type: PhantomData,
        }
    }

    /// Generates initial runs from the input file and registers them in the arena.
    pub fn generate<F>(&self, input: &Path, arena: &mut RunArena, compare: F) -> io::Result<GeneratedRuns>
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let layout = PageLayout::direct(self.chunk_capacity);
        let mut reader = RecordReader::open(input, layout, self.codec.clone(), self.stats.clone())?;
        let mut runs = Vec::new();
        let mut records = 0;

        loop {
            let mut chunk = ChunkBuffer::new(self.chunk_capacity);
            while !chunk.is_full() {
                match reader.read_record()? {
                    Some(item) => chunk.push(item),
                    None => break,
                }
            }

            if chunk.is_empty() {
                break;
            }

            records += chunk.len() as u64;
            runs.push(self.create_run(arena, chunk, compare)?);
        }

        log::debug!("generated {} runs from {} records", runs.len(), records);

        return Ok(GeneratedRuns { runs, records });
    }

    fn create_run<F>(&self, arena: &mut RunArena, mut chunk: ChunkBuffer<T>, compare: F) -> io::Result<RunId>
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        log::trace!("sorting chunk data ({} records)", chunk.len());
        chunk.sort_by(self.thread_pool, compare);

        let pending = arena.allocate()?;
        let layout = PageLayout::direct(self.chunk_capacity);
        let mut writer = RecordWriter::create(pending.path(), layout, self.codec.clone(), self.stats.clone())?;
        writer.write_all(chunk)?;
        let len = writer.finish()?;

        return Ok(arena.register(pending, len));
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::RunGenerator;
    use crate::codec::FixedCodec;
    use crate::io_stats::IoStats;
    use crate::run::RunArena;
    use crate::stream::{read_records, write_records};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[fixture]
    fn thread_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[rstest]
    #[case(100, 8, 13)]
    #[case(96, 8, 12)]
    #[case(1000, 32, 32)]
    #[case(5, 1, 5)]
    #[case(3, 10, 1)]
    #[case(0, 4, 0)]
    fn test_run_generation(
        tmp_dir: tempfile::TempDir,
        thread_pool: rayon::ThreadPool,
        #[case] records: i64,
        #[case] chunk_capacity: usize,
        #[case] expected_runs: usize,
    ) {
        let mut input = Vec::from_iter(0..records);
        input.shuffle(&mut rand::thread_rng());
        let input_path = tmp_dir.path().join("input.bin");
        write_records(&input_path, input, FixedCodec::default()).unwrap();

        let codec = FixedCodec::<i64>::default();
        let stats = IoStats::new();
        let mut arena = RunArena::new(tmp_dir.path());

        let generator = RunGenerator::new(chunk_capacity, &codec, &stats, &thread_pool);
        let generated = generator.generate(&input_path, &mut arena, i64::cmp).unwrap();

        assert_eq!(generated.records, records as u64);
        assert_eq!(generated.runs.len(), expected_runs);
        assert_eq!(stats.reads(), expected_runs as u64);
        assert_eq!(stats.writes(), expected_runs as u64);

        let mut restored = Vec::new();
        for (idx, id) in generated.runs.iter().enumerate() {
            let run = arena.get(*id).unwrap();
            if idx + 1 < generated.runs.len() {
                assert_eq!(run.len(), chunk_capacity as u64);
            } else {
                assert!(run.len() >= 1 && run.len() <= chunk_capacity as u64);
            }

            let items: Vec<i64> = read_records(run.path(), FixedCodec::default()).unwrap();
            assert_eq!(items.len() as u64, run.len());
            assert!(items.windows(2).all(|w| w[0] <= w[1]));
            restored.extend(items);
        }

        restored.sort();
        assert_eq!(restored, Vec::from_iter(0..records));
    }
}
