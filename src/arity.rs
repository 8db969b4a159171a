//! Merge arity selection.
//!
//! The arity of the merge passes can be fixed up front, predicted by an analytical cost model
//! ([`optimal_arity`]) or found experimentally by running the sorter with several candidates
//! ([`tune`]). The analytical prediction is reported next to every measurement but measured
//! results never feed back into it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log;

use crate::codec::RecordCodec;
use crate::sort::{ExternalSorter, SortError, SortMethod, SortReport};

/// Smallest arity a merge can have.
pub const MIN_ARITY: usize = 2;

/// Cost model evaluation for a single arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArityEstimate {
    pub arity: usize,
    /// Records per merge page: `floor(B / (s·(k+1)))`, at least one.
    pub page_records: u64,
    /// Runs the model assumes: `ceil(N / page_records)`.
    pub runs: u64,
    /// `ceil(log_k runs)`.
    pub passes: u64,
    /// Estimated record transfers: `2·N·(passes + 1)`.
    pub cost: u64,
}

/// Number of `arity`-way merge passes needed to reduce `runs` runs to one.
pub fn pass_count(runs: u64, arity: usize) -> u64 {
    let arity = arity.max(MIN_ARITY) as u64;
    let mut runs = runs;
    let mut passes = 0;
    while runs > 1 {
        runs = (runs + arity - 1) / arity;
        passes += 1;
    }
    return passes;
}

/// Largest arity worth considering for the given budget and record size.
pub fn max_arity(memory_budget: u64, record_size: usize) -> usize {
    let capacity = memory_budget / record_size.max(1) as u64;
    return (capacity.saturating_sub(1) as usize).max(MIN_ARITY);
}

/// Evaluates the cost model for one arity.
///
/// # Arguments
/// * `memory_budget` - Memory budget in bytes
/// * `record_size` - Record size in bytes
/// * `records` - Number of records to be sorted
/// * `arity` - Evaluated arity
pub fn cost_estimate(memory_budget: u64, record_size: usize, records: u64, arity: usize) -> ArityEstimate {
    let page_records = (memory_budget / ((arity as u64 + 1) * record_size.max(1) as u64)).max(1);
    let runs = (records + page_records - 1) / page_records;
    let passes = pass_count(runs, arity);

    return ArityEstimate {
        arity,
        page_records,
        runs,
        passes,
        cost: 2 * records * (passes + 1),
    };
}

/// Returns the arity with the lowest estimated cost, the smallest one on ties.
/// If the budget leaves no arity above [`MIN_ARITY`] feasible, [`MIN_ARITY`] is returned.
///
/// The scan stops at the first arity whose pass count no larger arity can beat. The model's
/// run count never decreases with the arity, and it exceeds the arity itself whenever the
/// input is at least as large as the budget, so such inputs need two passes or more.
pub fn optimal_arity(memory_budget: u64, record_size: usize, records: u64) -> usize {
    let upper = (memory_budget / record_size.max(1) as u64).saturating_sub(1) as usize;
    let input_bytes = records as u128 * record_size as u128;
    let least_passes = if input_bytes >= memory_budget as u128 { 2 } else { 1 };

    let mut best: Option<ArityEstimate> = None;
    for arity in MIN_ARITY..=upper {
        let estimate = cost_estimate(memory_budget, record_size, records, arity);
        match best {
            Some(current) if current.cost <= estimate.cost => {}
            _ => best = Some(estimate),
        }
        if estimate.passes <= least_passes {
            break;
        }
    }

    return best.map_or(MIN_ARITY, |estimate| estimate.arity);
}

/// Sorting algorithm as named in result files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Merge passes with a fixed arity.
    ExternalMergesort,
    /// Merge sort sweep over candidate arities, the fastest one wins.
    ExternalMergesortAuto,
    /// Merge sort ternary search over arities minimizing page I/O.
    ExternalMergesortSearch,
    /// Partitioning with a fixed arity.
    ExternalQuicksort,
    /// Quicksort sweep over candidate arities, the fastest one wins.
    ExternalQuicksortAuto,
    /// Quicksort ternary search over arities minimizing page I/O.
    ExternalQuicksortSearch,
}

impl Algorithm {
    /// Algorithm running `method` with arities picked by `strategy`.
    pub fn new(method: SortMethod, strategy: &ArityStrategy) -> Self {
        match (method, strategy) {
            (SortMethod::Mergesort, ArityStrategy::Fixed(_)) => Algorithm::ExternalMergesort,
            (SortMethod::Mergesort, ArityStrategy::Auto(_)) => Algorithm::ExternalMergesortAuto,
            (SortMethod::Mergesort, ArityStrategy::Search { .. }) => Algorithm::ExternalMergesortSearch,
            (SortMethod::Quicksort, ArityStrategy::Fixed(_)) => Algorithm::ExternalQuicksort,
            (SortMethod::Quicksort, ArityStrategy::Auto(_)) => Algorithm::ExternalQuicksortAuto,
            (SortMethod::Quicksort, ArityStrategy::Search { .. }) => Algorithm::ExternalQuicksortSearch,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::ExternalMergesort => "ExternalMergesort",
            Algorithm::ExternalMergesortAuto => "ExternalMergesort-Auto",
            Algorithm::ExternalMergesortSearch => "ExternalMergesort-Search",
            Algorithm::ExternalQuicksort => "ExternalQuicksort",
            Algorithm::ExternalQuicksortAuto => "ExternalQuicksort-Auto",
            Algorithm::ExternalQuicksortSearch => "ExternalQuicksort-Search",
        }
    }

    pub fn method(&self) -> SortMethod {
        match self {
            Algorithm::ExternalMergesort | Algorithm::ExternalMergesortAuto | Algorithm::ExternalMergesortSearch => {
                SortMethod::Mergesort
            }
            Algorithm::ExternalQuicksort | Algorithm::ExternalQuicksortAuto | Algorithm::ExternalQuicksortSearch => {
                SortMethod::Quicksort
            }
        }
    }

    pub fn all() -> [Algorithm; 6] {
        [
            Algorithm::ExternalMergesort,
            Algorithm::ExternalMergesortAuto,
            Algorithm::ExternalMergesortSearch,
            Algorithm::ExternalQuicksort,
            Algorithm::ExternalQuicksortAuto,
            Algorithm::ExternalQuicksortSearch,
        ]
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::all()
            .into_iter()
            .find(|algorithm| algorithm.name() == s)
            .ok_or_else(|| format!("unknown algorithm: {}", s))
    }
}

/// How the merge arity is picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArityStrategy {
    Fixed(usize),
    Auto(Vec<usize>),
    Search { min: usize, max: usize },
}


/// Result of an arity tuning session.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningReport {
    /// Sort reports in the order the trials were run.
    pub trials: Vec<SortReport>,
    /// Arity that performed best in the trials.
    pub best_arity: usize,
    /// Arity predicted by the cost model.
    pub optimal_arity: usize,
}

/// Merge sorts `input` into `output` following the strategy and reports every trial.
/// See [`tune_method`].
pub fn tune<T, C>(
    sorter: &ExternalSorter<T, C>,
    input: &Path,
    output: &Path,
    strategy: &ArityStrategy,
) -> Result<TuningReport, SortError>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    tune_method(sorter, SortMethod::Mergesort, input, output, strategy)
}

/// Sorts `input` into `output` with `method` following the strategy and reports every trial.
///
/// * `Fixed` runs a single sort.
/// * `Auto` runs one sort per distinct candidate and picks the fastest one.
/// * `Search` narrows `[min, max]` with a ternary search on page I/O and scans the last
///   (at most four) arities linearly, picking the one with the fewest page accesses.
///
/// Every arity is validated before the first sort starts. The cost model is evaluated once,
/// by the first trial, and its prediction is shared by the others.
pub fn tune_method<T, C>(
    sorter: &ExternalSorter<T, C>,
    method: SortMethod,
    input: &Path,
    output: &Path,
    strategy: &ArityStrategy,
) -> Result<TuningReport, SortError>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    let mut trial = Trial {
        sorter,
        method,
        input,
        output,
        optimal_arity: None,
    };

    let (trials, best_arity) = match strategy {
        ArityStrategy::Fixed(arity) => {
            let report = trial.run(*arity)?;
            (vec![report], *arity)
        }
        ArityStrategy::Auto(candidates) => sweep(&mut trial, candidates)?,
        ArityStrategy::Search { min, max } => search(&mut trial, *min, *max)?,
    };

    let optimal_arity = match trials.first() {
        Some(report) => report.optimal_arity,
        None => return Err(SortError::Config("no arity was tried".to_string())),
    };
    log::info!("best arity: {}, optimal arity: {}", best_arity, optimal_arity);

    return Ok(TuningReport {
        trials,
        best_arity,
        optimal_arity,
    });
}

/// One sort of a tuning session.
struct Trial<'a, T, C: RecordCodec<T>> {
    sorter: &'a ExternalSorter<T, C>,
    method: SortMethod,
    input: &'a Path,
    output: &'a Path,
    optimal_arity: Option<usize>,
}

impl<'a, T, C> Trial<'a, T, C>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    fn run(&mut self, arity: usize) -> Result<SortReport, SortError> {
        let report = self
            .sorter
            .sort_with(self.method, self.input, self.output, arity, self.optimal_arity)?;
        self.optimal_arity = Some(report.optimal_arity);

        return Ok(report);
    }
}

fn sweep<T, C>(trial: &mut Trial<'_, T, C>, candidates: &[usize]) -> Result<(Vec<SortReport>, usize), SortError>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    let mut arities: Vec<usize> = Vec::with_capacity(candidates.len());
    for arity in candidates {
        if !arities.contains(arity) {
            arities.push(*arity);
        }
    }
    if arities.is_empty() {
        return Err(SortError::Config("arity sweep needs at least one candidate".to_string()));
    }
    for arity in &arities {
        trial.sorter.validate_arity(*arity)?;
    }

    let mut trials: Vec<SortReport> = Vec::with_capacity(arities.len());
    for arity in arities {
        log::info!("sweep: sorting with arity {}", arity);
        trials.push(trial.run(arity)?);
    }

    let mut best = &trials[0];
    for report in &trials[1..] {
        if report.elapsed < best.elapsed {
            best = report;
        }
    }
    let best_arity = best.arity;

    return Ok((trials, best_arity));
}

fn search<T, C>(trial: &mut Trial<'_, T, C>, min: usize, max: usize) -> Result<(Vec<SortReport>, usize), SortError>
where
    T: Ord + Send,
    C: RecordCodec<T>,
{
    if min > max {
        return Err(SortError::Config(format!("empty arity range [{}, {}]", min, max)));
    }
    trial.sorter.validate_arity(min)?;
    trial.sorter.validate_arity(max)?;

    let mut trials: Vec<SortReport> = Vec::new();
    let mut evaluate = |arity: usize| -> Result<u64, SortError> {
        if let Some(report) = trials.iter().find(|report| report.arity == arity) {
            return Ok(report.disk_io());
        }
        log::info!("search: sorting with arity {}", arity);
        let report = trial.run(arity)?;
        let cost = report.disk_io();
        trials.push(report);
        return Ok(cost);
    };

    let (mut low, mut high) = (min, max);
    while high - low > 3 {
        let third = (high - low) / 3;
        let (m1, m2) = (low + third, high - third);
        if evaluate(m1)? < evaluate(m2)? {
            high = m2;
        } else {
            low = m1;
        }
    }
    for arity in low..=high {
        evaluate(arity)?;
    }

    let mut best = &trials[0];
    for report in &trials[1..] {
        let better = report.disk_io() < best.disk_io()
            || (report.disk_io() == best.disk_io() && report.arity < best.arity);
        if better {
            best = report;
        }
    }
    let best_arity = best.arity;

    return Ok((trials, best_arity));
}
