use std::path;

use bytesize::KB;
use env_logger;
use log;
use rand::Rng;

use arity_sort::stream::{read_records, write_records};
use arity_sort::{arity, ArityStrategy, ExternalSorter, ExternalSorterBuilder, FixedCodec};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let mut rng = rand::thread_rng();
    let input: Vec<i64> = (0..100_000).map(|_| rng.gen()).collect();
    write_records(path::Path::new("input.bin"), input, FixedCodec::default()).unwrap();

    let sorter: ExternalSorter<i64, FixedCodec<i64>> = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_memory_budget(64 * KB)
        .build()
        .unwrap();

    let optimal = arity::optimal_arity(sorter.memory_budget(), sorter.record_size(), 100_000);
    let strategy = ArityStrategy::Auto(vec![2, 4, 8, optimal]);
    let tuning = arity::tune(
        &sorter,
        path::Path::new("input.bin"),
        path::Path::new("output.bin"),
        &strategy,
    )
    .unwrap();

    for report in &tuning.trials {
        println!(
            "arity {:>3}: {} passes, {} reads, {} writes, {:.3}s",
            report.arity,
            report.passes,
            report.disk_reads,
            report.disk_writes,
            report.elapsed.as_secs_f64()
        );
    }
    println!("fastest arity: {}, predicted: {}", tuning.best_arity, tuning.optimal_arity);

    let quick = sorter
        .quicksort_file(path::Path::new("input.bin"), path::Path::new("output.bin"), optimal)
        .unwrap();
    println!(
        "quicksort arity {:>3}: {} levels, {} reads, {} writes, {:.3}s",
        quick.arity,
        quick.passes,
        quick.disk_reads,
        quick.disk_writes,
        quick.elapsed.as_secs_f64()
    );

    let sorted: Vec<i64> = read_records(path::Path::new("output.bin"), FixedCodec::default()).unwrap();
    assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
}
