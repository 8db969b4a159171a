//! `arity-sort` is an external k-way merge sort with page-level I/O accounting.
//! An external quicksort partitioning its input `k` ways is provided for comparison.
//!
//! External sorting handles data that does not fit into the main memory of a computer. The input is
//! split into sorted runs that each fit into the memory budget, then the runs are merged `k` at a
//! time until a single sorted run is left. The number of runs merged at once, the arity, trades the
//! number of merge passes against the size of every merge buffer. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `arity-sort` supports the following features:
//!
//! * **Page-level I/O accounting:**
//!   every page read from or written to disk is counted, so sorts with different arities can be
//!   compared by the number of disk accesses as well as by wall-clock time.
//! * **Arity selection:**
//!   the arity can be fixed, predicted by an analytical cost model or tuned experimentally
//!   (see [`arity`]).
//! * **Data agnostic:**
//!   fixed-width integers are stored as raw little-endian bytes, any `serde` type can be stored
//!   using `MessagePack`.
//! * **Bounded memory:**
//!   every stream owns a single page and all pages of a pass together fit into the memory budget.
//! * **Multithreading support:**
//!   runs are sorted on a thread pool, independent merge batches of one pass can be merged concurrently.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use arity_sort::{arity, ArityStrategy, ExternalSorter, ExternalSorterBuilder, FixedCodec};
//!
//! fn main() {
//!     let sorter: ExternalSorter<i64, FixedCodec<i64>> = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_memory_budget(50 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let report = sorter.sort_file(Path::new("input.bin"), Path::new("output.bin"), 16).unwrap();
//!     println!("{} passes, {} page accesses", report.passes, report.disk_io());
//!
//!     let report = sorter.quicksort_file(Path::new("input.bin"), Path::new("output.bin"), 16).unwrap();
//!     println!("{} partitioning levels, {} page accesses", report.passes, report.disk_io());
//!
//!     let strategy = ArityStrategy::Auto(vec![2, 4, 8, 16]);
//!     let tuning = arity::tune(&sorter, Path::new("input.bin"), Path::new("output.bin"), &strategy).unwrap();
//!     println!("best: {}, predicted: {}", tuning.best_arity, tuning.optimal_arity);
//! }
//! ```

pub mod arity;
pub mod buffer;
pub mod codec;
pub mod generator;
pub mod io_stats;
pub mod merger;
pub mod quicksort;
pub mod report;
pub mod run;
pub mod sort;
pub mod stream;

pub use arity::{optimal_arity, tune, tune_method, Algorithm, ArityStrategy, TuningReport};
pub use codec::{FixedCodec, FixedWidth, RecordCodec, RmpCodec};
pub use io_stats::{IoSnapshot, IoStats};
pub use merger::BinaryHeapMerger;
pub use report::{write_csv, ResultRow};
pub use run::RunId;
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortMethod, SortPhase, SortReport};
