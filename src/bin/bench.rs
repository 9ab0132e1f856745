//! Runs a random set/get benchmark against a bitcask store, reporting
//! throughput and latency percentiles per phase.

use std::time::{Duration, Instant};

use clap::Parser;
use hdrhistogram::Histogram;
use rand::Rng;

use bitcask::{BitCask, Error, Options, Result};

#[derive(Parser)]
#[command(name = "bench", about = "bitcask benchmark driver", version)]
struct Args {
    /// Number of operations per phase.
    #[arg(long, default_value_t = 10_000)]
    num: usize,
    /// Value size in bytes.
    #[arg(long, default_value_t = 1024)]
    value_size: usize,
    /// Database directory.
    #[arg(long, default_value = "./db_bench")]
    db: String,
    /// Segment rotation threshold in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_file_size: u64,
    /// Run a merge between the set and get phases.
    #[arg(long, default_value_t = false)]
    merge: bool,
}

fn main() -> Result<()> {
    simplelog::SimpleLogger::init(simplelog::LevelFilter::Info, simplelog::Config::default())
        .map_err(|err| Error::Internal(err.to_string()))?;
    let args = Args::parse();

    let opts = Options { max_file_size: args.max_file_size, ..Options::default() };
    let store = BitCask::open(args.db.as_str(), opts)?;

    bench_random_set(&store, args.num, args.value_size)?;
    if args.merge {
        let start = Instant::now();
        store.merge()?;
        println!("merge: {:.2}s", start.elapsed().as_secs_f64());
    }
    bench_random_get(&store, args.num, args.value_size)?;
    store.close()
}

fn histogram() -> Result<Histogram<u64>> {
    Histogram::new(3).map_err(|err| Error::Internal(err.to_string()))
}

fn random_key(rng: &mut impl Rng, num: usize) -> String {
    format!("{:09}", rng.gen_range(0..num))
}

fn bench_random_set(store: &BitCask, num: usize, value_size: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut hist = histogram()?;
    let value = vec![0u8; value_size];
    let start = Instant::now();
    for _ in 0..num {
        let key = random_key(&mut rng, num);
        let op = Instant::now();
        store.set(key.as_bytes(), value.clone())?;
        hist.record(op.elapsed().as_micros() as u64).ok();
    }
    report("set", num, num * value_size, start.elapsed(), &hist);
    Ok(())
}

fn bench_random_get(store: &BitCask, num: usize, value_size: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut hist = histogram()?;
    let mut found = 0;
    let start = Instant::now();
    for _ in 0..num {
        let key = random_key(&mut rng, num);
        let op = Instant::now();
        if store.get(key.as_bytes())?.is_some() {
            found += 1;
        }
        hist.record(op.elapsed().as_micros() as u64).ok();
    }
    report("get", num, num * value_size, start.elapsed(), &hist);
    println!("found {found} out of {num}");
    Ok(())
}

fn report(name: &str, ops: usize, bytes: usize, elapsed: Duration, hist: &Histogram<u64>) {
    let secs = elapsed.as_secs_f64();
    println!(
        "{name}: {ops} ops in {secs:.2}s ({:.0} ops/s, {:.1} MB/s, {:.1} µs/op)",
        ops as f64 / secs,
        bytes as f64 / 1e6 / secs,
        secs * 1e6 / ops as f64,
    );
    println!(
        "{name} latency µs: p50={} p95={} p99={} max={}",
        hist.value_at_quantile(0.5),
        hist.value_at_quantile(0.95),
        hist.value_at_quantile(0.99),
        hist.max(),
    );
}
