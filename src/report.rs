//! Experiment result rows.

use std::io::{self, prelude::*};

use crate::arity::{Algorithm, TuningReport};
use crate::sort::SortReport;

/// Column names of a results file.
pub const CSV_HEADER: &str = "Algorithm,DataType,Size,MemorySize,Arity,OptimalArity,Time,DiskReads,DiskWrites";

/// One line of a results file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub algorithm: Algorithm,
    pub data_type: String,
    /// Input size in records.
    pub size: u64,
    /// Memory budget in bytes.
    pub memory_size: u64,
    pub arity: usize,
    pub optimal_arity: usize,
    /// Wall-clock time in seconds.
    pub time: f64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

impl ResultRow {
    pub fn new(algorithm: Algorithm, data_type: &str, report: &SortReport) -> Self {
        ResultRow {
            algorithm,
            data_type: data_type.to_string(),
            size: report.records,
            memory_size: report.memory_budget,
            arity: report.arity,
            optimal_arity: report.optimal_arity,
            time: report.elapsed.as_secs_f64(),
            disk_reads: report.disk_reads,
            disk_writes: report.disk_writes,
        }
    }

    /// Creates one row per trial of a tuning session.
    pub fn from_tuning(algorithm: Algorithm, data_type: &str, tuning: &TuningReport) -> Vec<Self> {
        tuning
            .trials
            .iter()
            .map(|report| ResultRow::new(algorithm, data_type, report))
            .collect()
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{:.6},{},{}",
            self.algorithm,
            self.data_type,
            self.size,
            self.memory_size,
            self.arity,
            self.optimal_arity,
            self.time,
            self.disk_reads,
            self.disk_writes
        )
    }
}

/// Writes the rows in CSV format, preceded by [`CSV_HEADER`] if `with_header` is set.
pub fn write_csv<W: Write>(writer: &mut W, rows: &[ResultRow], with_header: bool) -> io::Result<()> {
    if with_header {
        writeln!(writer, "{}", CSV_HEADER)?;
    }
    for row in rows {
        writeln!(writer, "{}", row.to_csv())?;
    }

    return writer.flush();
}
