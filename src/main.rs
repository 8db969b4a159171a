use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arity_sort::arity::{self, Algorithm, ArityStrategy, TuningReport};
use arity_sort::codec::{FixedCodec, RecordCodec, RmpCodec};
use arity_sort::report::{write_csv, ResultRow};
use arity_sort::stream::{count_records, write_records};
use arity_sort::{ExternalSorter, ExternalSorterBuilder};

/// Weighted graph edge. Edges are ordered by weight first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
struct Edge {
    weight: i64,
    from: u32,
    to: u32,
}

struct Settings {
    algorithm: Algorithm,
    size: u64,
    memory: u64,
    arity: Option<usize>,
    arities: Vec<usize>,
    min_arity: usize,
    max_arity: Option<usize>,
    seed: u64,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    threads: Option<usize>,
    merge_workers: usize,
}

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let data_type: DataType = arg_parser.value_of_t_or_exit("data_type");
    let memory = arg_parser.value_of("memory").expect("value is required");
    let settings = Settings {
        algorithm: arg_parser.value_of_t_or_exit("algorithm"),
        size: arg_parser.value_of_t_or_exit("size"),
        memory: memory.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        arity: arg_parser
            .is_present("arity")
            .then(|| arg_parser.value_of_t_or_exit("arity")),
        arities: arg_parser.values_of_t_or_exit("arities"),
        min_arity: arg_parser.value_of_t_or_exit("min_arity"),
        max_arity: arg_parser
            .is_present("max_arity")
            .then(|| arg_parser.value_of_t_or_exit("max_arity")),
        seed: arg_parser.value_of_t_or_exit("seed"),
        input: arg_parser.value_of("input").map(PathBuf::from),
        output: arg_parser.value_of("output").map(PathBuf::from),
        tmp_dir: arg_parser.value_of("tmp_dir").map(PathBuf::from),
        threads: arg_parser
            .is_present("threads")
            .then(|| arg_parser.value_of_t_or_exit("threads")),
        merge_workers: arg_parser.value_of_t_or_exit("merge_workers"),
    };

    let result = match data_type {
        DataType::Int64 => run_experiment::<i64, FixedCodec<i64>, _>(&settings, |rng, _| rng.gen()),
        DataType::Edge => run_experiment::<Edge, RmpCodec<Edge>, _>(&settings, |rng, nodes| Edge {
            weight: rng.gen_range(0..1_000_000),
            from: rng.gen_range(0..nodes),
            to: rng.gen_range(0..nodes),
        }),
    };

    let tuning = match result {
        Ok(tuning) => tuning,
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    };

    let rows = ResultRow::from_tuning(settings.algorithm, data_type.name(), &tuning);

    if let Err(err) = write_csv(&mut io::stdout().lock(), &rows, true) {
        log::error!("results printing error: {}", err);
        process::exit(1);
    }

    if let Some(results) = arg_parser.value_of("results") {
        if let Err(err) = append_results(Path::new(results), &rows) {
            log::error!("results saving error: {}", err);
            process::exit(1);
        }
    }
}

fn run_experiment<T, C, G>(settings: &Settings, mut generate: G) -> Result<TuningReport, String>
where
    T: Ord + Send,
    C: RecordCodec<T>,
    G: FnMut(&mut StdRng, u32) -> T,
{
    let mut sorter_builder = ExternalSorterBuilder::<T, C>::new()
        .with_memory_budget(settings.memory)
        .with_record_size(mem::size_of::<T>())
        .with_merge_workers(settings.merge_workers)
        .with_pivot_seed(settings.seed);

    if let Some(threads) = settings.threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = &settings.tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(tmp_dir);
    }

    let sorter: ExternalSorter<T, C> = sorter_builder
        .build()
        .map_err(|err| format!("sorter initialization error: {}", err))?;

    let scratch = tempfile::tempdir_in(settings.tmp_dir.as_deref().unwrap_or_else(|| Path::new(".")))
        .map_err(|err| format!("scratch directory creation error: {}", err))?;

    let input = match &settings.input {
        Some(input) => input.clone(),
        None => {
            let input = scratch.path().join("input.bin");
            let mut rng = StdRng::seed_from_u64(settings.seed);
            let nodes = settings.size.clamp(1, u32::MAX as u64) as u32;
            let records = (0..settings.size).map(|_| generate(&mut rng, nodes));

            log::info!("generating {} records (seed: {})", settings.size, settings.seed);
            write_records(&input, records, C::default()).map_err(|err| format!("input generation error: {}", err))?;
            input
        }
    };

    let output = match &settings.output {
        Some(output) => output.clone(),
        None => scratch.path().join("output.bin"),
    };

    let strategy = match settings.algorithm {
        Algorithm::ExternalMergesort | Algorithm::ExternalQuicksort => match settings.arity {
            Some(arity) => ArityStrategy::Fixed(arity),
            None => {
                let records = match &settings.input {
                    Some(input) => count_records(input, C::default())
                        .map_err(|err| format!("input file error: {}", err))?,
                    None => settings.size,
                };
                ArityStrategy::Fixed(arity::optimal_arity(
                    sorter.memory_budget(),
                    sorter.record_size(),
                    records,
                ))
            }
        },
        Algorithm::ExternalMergesortAuto | Algorithm::ExternalQuicksortAuto => {
            ArityStrategy::Auto(settings.arities.clone())
        }
        Algorithm::ExternalMergesortSearch | Algorithm::ExternalQuicksortSearch => ArityStrategy::Search {
            min: settings.min_arity,
            max: settings.max_arity.unwrap_or_else(|| sorter.max_arity()),
        },
    };
    log::info!("running {} with {:?}", settings.algorithm, strategy);

    return arity::tune_method(&sorter, settings.algorithm.method(), &input, &output, &strategy)
        .map_err(|err| format!("data sorting error: {}", err));
}

fn append_results(path: &Path, rows: &[ResultRow]) -> io::Result<()> {
    let with_header = fs::metadata(path).map(|meta| meta.len() == 0).unwrap_or(true);
    let mut file = io::BufWriter::new(fs::OpenOptions::new().create(true).append(true).open(path)?);

    return write_csv(&mut file, rows, with_header);
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum DataType {
    Int64,
    Edge,
}

impl DataType {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        DataType::value_variants().iter().filter_map(|v| v.to_possible_value())
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int64 => "int64",
            DataType::Edge => "edge",
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <DataType as clap::ArgEnum>::from_str(s, false)
    }
}

fn algorithm_names() -> impl Iterator<Item = &'static str> {
    Algorithm::all().into_iter().map(|algorithm| algorithm.name())
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("arity-sort")
        .about("external k-way merge sort and quicksort experiments")
        .arg(
            clap::Arg::new("algorithm")
                .short('a')
                .long("algorithm")
                .help("sorting algorithm")
                .takes_value(true)
                .default_value("ExternalMergesort")
                .possible_values(algorithm_names()),
        )
        .arg(
            clap::Arg::new("data_type")
                .short('t')
                .long("data-type")
                .help("type of the sorted records")
                .takes_value(true)
                .default_value("int64")
                .possible_values(DataType::possible_values()),
        )
        .arg(
            clap::Arg::new("size")
                .short('n')
                .long("size")
                .help("number of records to generate")
                .takes_value(true)
                .default_value("1000000"),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget")
                .required(true)
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("arity")
                .short('k')
                .long("arity")
                .help("merge or partitioning arity, the analytical optimum is used if omitted")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("arities")
                .long("arities")
                .help("candidate arities of the automatic sweep")
                .takes_value(true)
                .use_delimiter(true)
                .default_value("2,4,8,16"),
        )
        .arg(
            clap::Arg::new("min_arity")
                .long("min-arity")
                .help("lower bound of the arity search")
                .takes_value(true)
                .default_value("2"),
        )
        .arg(
            clap::Arg::new("max_arity")
                .long("max-arity")
                .help("upper bound of the arity search, the largest feasible arity if omitted")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("seed")
                .short('s')
                .long("seed")
                .help("seed of the input generator and of the quicksort pivot sampler")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted, random records are generated if omitted")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("results")
                .short('r')
                .long("results")
                .help("CSV file the result rows are appended to")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('j')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("merge_workers")
                .short('w')
                .long("merge-workers")
                .help("number of merge batches processed concurrently")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
