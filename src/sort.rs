//! External sorter.

use log;
use rayon::prelude::*;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::arity;
use crate::codec::{RecordCodec, RmpCodec};
use crate::generator::RunGenerator;
use crate::io_stats::IoStats;
use crate::merger::BinaryHeapMerger;
use crate::quicksort::ExternalQuicksort;
use crate::run::{PendingRun, RunArena, RunId};
use crate::stream::{PageLayout, RecordReader, RecordWriter};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter configuration: memory budget, record size or arity.
    Config(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input or output stream I/O error.
    IO(io::Error),
    /// A run became unreadable during a merge.
    MergeFailure { run: RunId, source: io::Error },
}

impl SortError {
    pub(crate) fn missing_run(run: RunId) -> SortError {
        SortError::MergeFailure {
            run,
            source: io::Error::new(io::ErrorKind::NotFound, "run is not in the arena"),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Config(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::MergeFailure { source, .. } => Some(source),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::MergeFailure { run, source } => write!(f, "merge failed reading {}: {}", run, source),
        }
    }
}

/// External sorting method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortMethod {
    /// Sorted runs merged `arity` at a time.
    Mergesort,
    /// Input partitioned around `arity - 1` pivots until every partition fits into memory.
    Quicksort,
}

/// Phase of a single merge sort invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPhase {
    Idle,
    Generating,
    Merging { pass: usize },
    Done,
}

impl SortPhase {
    /// Returns the phase that follows this one given the number of runs currently left.
    pub fn advance(self, runs: usize) -> SortPhase {
        match self {
            SortPhase::Idle => SortPhase::Generating,
            SortPhase::Generating if runs > 1 => SortPhase::Merging { pass: 1 },
            SortPhase::Merging { pass } if runs > 1 => SortPhase::Merging { pass: pass + 1 },
            SortPhase::Generating | SortPhase::Merging { .. } | SortPhase::Done => SortPhase::Done,
        }
    }
}

/// Outcome of one sort invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SortReport {
    pub method: SortMethod,
    /// Arity the merge passes (or partitionings) were run with.
    pub arity: usize,
    /// Arity predicted by the analytical cost model for the same input.
    pub optimal_arity: usize,
    /// Number of sorted records.
    pub records: u64,
    pub record_size: usize,
    pub memory_budget: u64,
    /// Number of runs produced by run generation, or of partitions sorted in memory.
    pub initial_runs: usize,
    /// Number of merge passes, or the depth of the partitioning.
    pub passes: usize,
    /// Wall-clock time of the sort, the cost model evaluation excluded.
    pub elapsed: Duration,
    /// Page reads.
    pub disk_reads: u64,
    /// Page writes.
    pub disk_writes: u64,
}

impl SortReport {
    /// Total page accesses.
    pub fn disk_io(&self) -> u64 {
        self.disk_reads + self.disk_writes
    }
}

/// What a sorting method leaves in the arena.
pub(crate) struct SortOutcome {
    /// Fully sorted run, `None` for an empty input.
    pub run: Option<RunId>,
    pub records: u64,
    pub initial_runs: usize,
    pub passes: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T, C = RmpCodec<T>>
where
    C: RecordCodec<T>,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Memory budget in bytes.
    memory_budget: Option<u64>,
    /// Record size in bytes used for memory budgeting.
    record_size: Option<usize>,
    /// Upper bound of concurrently merged batches.
    merge_workers: usize,
    /// Seed of the quicksort pivot sampler.
    pivot_seed: u64,
    /// Record codec.
    codec: C,

    /// Input item type.
    item_type: PhantomData<fn() -> T>,
}

impl<T, C> ExternalSorterBuilder<T, C>
where
    C: RecordCodec<T>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, C>, SortError> {
        let record_size = self.record_size.or(C::RECORD_SIZE).ok_or_else(|| {
            SortError::Config("record size is unknown for this codec, set it explicitly".to_string())
        })?;
        let memory_budget = self
            .memory_budget
            .ok_or_else(|| SortError::Config("memory budget is not set".to_string()))?;

        let sorter = ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            memory_budget,
            record_size,
            self.merge_workers,
            self.codec,
        )?;

        return Ok(ExternalSorter {
            pivot_seed: self.pivot_seed,
            ..sorter
        });
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets memory budget in bytes.
    pub fn with_memory_budget(mut self, bytes: u64) -> ExternalSorterBuilder<T, C> {
        self.memory_budget = Some(bytes);
        return self;
    }

    /// Sets record size in bytes. Required for codecs without a fixed record size.
    pub fn with_record_size(mut self, bytes: usize) -> ExternalSorterBuilder<T, C> {
        self.record_size = Some(bytes);
        return self;
    }

    /// Sets the maximum number of merge batches processed concurrently.
    /// The memory budget is split evenly between concurrent batches.
    pub fn with_merge_workers(mut self, workers: usize) -> ExternalSorterBuilder<T, C> {
        self.merge_workers = workers;
        return self;
    }

    /// Sets the seed quicksort pivots are sampled with.
    pub fn with_pivot_seed(mut self, seed: u64) -> ExternalSorterBuilder<T, C> {
        self.pivot_seed = seed;
        return self;
    }

    /// Sets record codec.
    pub fn with_codec(mut self, codec: C) -> ExternalSorterBuilder<T, C> {
        self.codec = codec;
        return self;
    }
}

impl<T, C> Default for ExternalSorterBuilder<T, C>
where
    C: RecordCodec<T>,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            memory_budget: None,
            record_size: None,
            merge_workers: 1,
            pivot_seed: 0,
            codec: C::default(),
            item_type: PhantomData,
        }
    }
}

struct MergeSource {
    id: RunId,
    path: PathBuf,
    len: u64,
}

struct MergeJob {
    sources: Vec<MergeSource>,
    output: PendingRun,
}

/// External sorter.
///
/// The sorter holds configuration only: every invocation counts its page I/O separately,
/// so one sorter may run several sorts at once.
pub struct ExternalSorter<T, C = RmpCodec<T>>
where
    C: RecordCodec<T>,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Memory budget in bytes.
    memory_budget: u64,
    /// Record size in bytes.
    record_size: usize,
    /// Upper bound of concurrently merged batches.
    merge_workers: usize,
    /// Seed of the quicksort pivot sampler.
    pivot_seed: u64,
    /// Record codec.
    codec: C,

    /// Input item type.
    item_type: PhantomData<fn() -> T>,
}

impl<T, C> ExternalSorter<T, C>
where
    C: RecordCodec<T>,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `memory_budget` - Total number of bytes the sorter may keep buffered.
    /// * `record_size` - Size of one record in bytes.
    /// * `merge_workers` - Maximum number of merge batches processed concurrently.
    /// * `codec` - Record codec.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        memory_budget: u64,
        record_size: usize,
        merge_workers: usize,
        codec: C,
    ) -> Result<Self, SortError> {
        if record_size == 0 {
            return Err(SortError::Config("record size must be positive".to_string()));
        }
        if memory_budget < record_size as u64 {
            return Err(SortError::Config(format!(
                "memory budget of {} bytes is too small to hold one record of {} bytes",
                memory_budget, record_size
            )));
        }
        if merge_workers == 0 {
            return Err(SortError::Config("at least one merge worker is required".to_string()));
        }

        return Ok(ExternalSorter {
            memory_budget,
            record_size,
            merge_workers,
            pivot_seed: 0,
            codec,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: Self::init_tmp_directory(tmp_path)?,
            item_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    pub(crate) fn thread_pool(&self) -> &rayon::ThreadPool {
        &self.thread_pool
    }

    pub(crate) fn pivot_seed(&self) -> u64 {
        self.pivot_seed
    }

    /// Number of records sorted in memory per initial run: `floor(B / s)`.
    pub fn chunk_capacity(&self) -> usize {
        (self.memory_budget / self.record_size as u64) as usize
    }

    /// Largest usable arity. One record slot is reserved for the merge output.
    pub fn max_arity(&self) -> usize {
        self.chunk_capacity().saturating_sub(1).max(2)
    }

    /// Checks that `arity` lies in `[2, max_arity]`.
    pub fn validate_arity(&self, arity: usize) -> Result<(), SortError> {
        if arity < 2 || arity > self.max_arity() {
            return Err(SortError::Config(format!(
                "arity {} is outside the feasible range [2, {}]",
                arity,
                self.max_arity()
            )));
        }

        return Ok(());
    }

    /// Number of merge batches processed concurrently for the given arity.
    /// Every worker needs room for at least one record per input plus one for the output.
    pub fn merge_workers_for(&self, arity: usize) -> usize {
        let slots = self.memory_budget / ((arity as u64 + 1) * self.record_size as u64);
        return self.merge_workers.min(slots.max(1) as usize);
    }

    /// Page size in records of every merge input and output stream: `floor(B / (w·(k+1)·s))`,
    /// where `w` is the number of concurrent workers.
    pub fn merge_page_records(&self, arity: usize, workers: usize) -> usize {
        let denominator = workers as u64 * (arity as u64 + 1) * self.record_size as u64;
        return (self.memory_budget / denominator).max(1) as usize;
    }

    /// Page layout of every merge input and output stream.
    pub fn merge_layout(&self, arity: usize, workers: usize) -> PageLayout {
        PageLayout::buffered(self.merge_page_records(arity, workers), self.record_size)
    }
}

impl<T, C> ExternalSorter<T, C>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    /// Sorts a record file using k-way merge passes of the given arity.
    /// The sorted records are written to `output` only if the whole sort succeeds.
    ///
    /// # Arguments
    /// * `input` - File of encoded records to be sorted
    /// * `output` - Result file
    /// * `arity` - Number of runs merged at once
    pub fn sort_file(&self, input: &Path, output: &Path, arity: usize) -> Result<SortReport, SortError> {
        self.sort_with(SortMethod::Mergesort, input, output, arity, None)
    }

    /// Sorts a record file by partitioning it around `arity - 1` pivots.
    /// The sorted records are written to `output` only if the whole sort succeeds.
    pub fn quicksort_file(&self, input: &Path, output: &Path, arity: usize) -> Result<SortReport, SortError> {
        self.sort_with(SortMethod::Quicksort, input, output, arity, None)
    }

    /// Runs one sort invocation.
    /// `optimal_arity` is evaluated from the cost model unless the caller already knows it.
    pub(crate) fn sort_with(
        &self,
        method: SortMethod,
        input: &Path,
        output: &Path,
        arity: usize,
        optimal_arity: Option<usize>,
    ) -> Result<SortReport, SortError> {
        self.validate_arity(arity)?;

        let stats = IoStats::new();
        let started = Instant::now();
        let mut arena = RunArena::new(self.tmp_dir.path());

        let outcome = match method {
            SortMethod::Mergesort => self.merge_sort(input, &mut arena, arity, &stats)?,
            SortMethod::Quicksort => ExternalQuicksort::new(self, arity, &stats).sort(input, &mut arena)?,
        };
        self.publish(&mut arena, outcome.run, output)?;

        let elapsed = started.elapsed();
        let io = stats.snapshot();

        let report = SortReport {
            method,
            arity,
            optimal_arity: optimal_arity
                .unwrap_or_else(|| arity::optimal_arity(self.memory_budget, self.record_size, outcome.records)),
            records: outcome.records,
            record_size: self.record_size,
            memory_budget: self.memory_budget,
            initial_runs: outcome.initial_runs,
            passes: outcome.passes,
            elapsed,
            disk_reads: io.reads,
            disk_writes: io.writes,
        };

        log::info!(
            "{:?}: {} records, arity {}, {} runs, {} passes, {} reads, {} writes in {:.3}s",
            method,
            report.records,
            report.arity,
            report.initial_runs,
            report.passes,
            report.disk_reads,
            report.disk_writes,
            report.elapsed.as_secs_f64()
        );

        return Ok(report);
    }

    /// Generates the initial runs of `input` and merges them into a single run.
    pub(crate) fn merge_sort(
        &self,
        input: &Path,
        arena: &mut RunArena,
        arity: usize,
        stats: &IoStats,
    ) -> Result<SortOutcome, SortError> {
        let mut phase = SortPhase::Idle.advance(0);
        log::debug!("{:?}: chunk capacity {} records", phase, self.chunk_capacity());

        let generated = RunGenerator::new(self.chunk_capacity(), &self.codec, stats, &self.thread_pool)
            .generate(input, arena, T::cmp)
            .map_err(SortError::IO)?;

        let initial_runs = generated.runs.len();
        let mut runs = generated.runs;
        let mut passes = 0;

        phase = phase.advance(runs.len());
        while let SortPhase::Merging { pass } = phase {
            log::debug!("{:?}: {} runs, arity {}", phase, runs.len(), arity);
            runs = self.merge_pass(arena, runs, arity, stats)?;
            passes = pass;
            phase = phase.advance(runs.len());
        }

        return Ok(SortOutcome {
            run: runs.first().copied(),
            records: generated.records,
            initial_runs,
            passes,
        });
    }

    /// Merges the runs batch by batch and returns the runs of the next pass in order.
    fn merge_pass(
        &self,
        arena: &mut RunArena,
        runs: Vec<RunId>,
        arity: usize,
        stats: &IoStats,
    ) -> Result<Vec<RunId>, SortError> {
        let workers = self.merge_workers_for(arity);
        let layout = self.merge_layout(arity, workers);

        let mut jobs = Vec::with_capacity(runs.len() / arity + 1);
        let mut carried = None;
        for batch in runs.chunks(arity) {
            if let [single] = batch {
                carried = Some(*single);
                continue;
            }

            let mut sources = Vec::with_capacity(batch.len());
            for id in batch {
                let run = arena.get(*id).ok_or_else(|| SortError::missing_run(*id))?;
                sources.push(MergeSource {
                    id: *id,
                    path: run.path().to_path_buf(),
                    len: run.len(),
                });
            }

            let output = arena.allocate().map_err(SortError::TempDir)?;
            jobs.push(MergeJob { sources, output });
        }

        let lens = if workers > 1 {
            let mut lens = Vec::with_capacity(jobs.len());
            for wave in jobs.chunks(workers) {
                let wave_lens: Result<Vec<u64>, SortError> = self
                    .thread_pool
                    .install(|| wave.par_iter().map(|job| self.merge_batch(job, layout, stats)).collect());
                lens.extend(wave_lens?);
            }
            lens
        } else {
            jobs.iter()
                .map(|job| self.merge_batch(job, layout, stats))
                .collect::<Result<Vec<u64>, SortError>>()?
        };

        let mut next_runs = Vec::with_capacity(jobs.len() + 1);
        for (job, len) in jobs.into_iter().zip(lens) {
            for source in &job.sources {
                arena.retire(source.id).map_err(SortError::IO)?;
            }
            next_runs.push(arena.register(job.output, len));
        }

        if let Some(id) = carried {
            let new_id = arena.relabel(id).ok_or_else(|| SortError::missing_run(id))?;
            log::trace!("carrying {} over as {}", id, new_id);
            next_runs.push(new_id);
        }

        return Ok(next_runs);
    }

    fn merge_batch(&self, job: &MergeJob, layout: PageLayout, stats: &IoStats) -> Result<u64, SortError> {
        log::trace!(
            "merging {} runs into {} (page: {} records)",
            job.sources.len(),
            job.output.id(),
            layout.records()
        );

        let mut readers = Vec::with_capacity(job.sources.len());
        for source in &job.sources {
            let id = source.id;
            let reader = RecordReader::open(&source.path, layout, self.codec.clone(), stats.clone())
                .map_err(|err| SortError::MergeFailure { run: id, source: err })?
                .with_expected_records(source.len);
            readers.push(reader.map(move |item| item.map_err(|err| (id, err))));
        }

        let mut writer =
            RecordWriter::create(job.output.path(), layout, self.codec.clone(), stats.clone()).map_err(SortError::IO)?;

        for item in BinaryHeapMerger::new(readers) {
            let item = item.map_err(|(run, err)| SortError::MergeFailure { run, source: err })?;
            writer.write_record(item).map_err(SortError::IO)?;
        }

        return writer.finish().map_err(SortError::IO);
    }

    fn publish(&self, arena: &mut RunArena, last: Option<RunId>, output: &Path) -> Result<(), SortError> {
        let run = match last {
            Some(id) => arena.take(id).ok_or_else(|| SortError::missing_run(id))?,
            None => {
                log::debug!("empty input, creating empty output");
                fs::File::create(output).map_err(SortError::IO)?;
                return Ok(());
            }
        };

        log::debug!("publishing {} ({} records) to {}", run.id(), run.len(), output.display());
        return run.persist(output).map_err(SortError::IO);
    }
}
