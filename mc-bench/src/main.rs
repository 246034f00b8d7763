//! # Memcached Load Driver
//!
//! Purpose: Drive a live memcached through `mc-client` with a repeatable
//! workload so throughput of the classic and meta paths can be compared over
//! time, and so the client can be smoke-tested against a real server.
//!
//! Usage: `mc-bench [config.json|-] [ops] [threads] [key_size] [value_size] [--json]`
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use fixed PRNG seeds for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Shared Pool**: Worker threads share one `Client`, exercising the pool
//!    the way an application would.

use std::env;
use std::fs;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mc_client::{Client, ClientConfig, ClientError, Item, MetaGetOptions, MetaSetOptions};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KEY_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_THREADS: usize = 4;
const DEFAULT_KEY_SIZE: usize = 16;
// Hex digits needed to keep all `KEY_COUNT` keys distinct.
const MIN_KEY_SIZE: usize = 3;
const DEFAULT_VALUE_SIZE: usize = 128;

struct BenchConfig {
    client: ClientConfig,
    op_count: usize,
    threads: usize,
    key_size: usize,
    value_size: usize,
    json: bool,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut json = false;
        let mut positional = Vec::new();
        for arg in env::args().skip(1) {
            if arg == "--json" {
                json = true;
            } else {
                positional.push(arg);
            }
        }
        let mut args = positional.into_iter();

        let client = match args.next().filter(|path| path != "-") {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("reading client config {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing client config {path}"))?
            }
            None => ClientConfig::default(),
        };

        Ok(BenchConfig {
            client,
            op_count: parse_usize(args.next(), DEFAULT_OP_COUNT),
            threads: parse_usize(args.next(), DEFAULT_THREADS).max(1),
            // Memcached keys top out at 250 bytes.
            key_size: parse_usize(args.next(), DEFAULT_KEY_SIZE)
                .clamp(MIN_KEY_SIZE, mc_client::MAX_KEY_LEN),
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE),
            json,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG.
///
/// XorShift is fast enough for load generation and keeps the workload reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

struct Workload {
    keys: Vec<String>,
    values: Vec<Vec<u8>>,
}

impl Workload {
    fn build(key_size: usize, value_size: usize) -> Self {
        let keys = (0..KEY_COUNT).map(|idx| bench_key(idx, key_size)).collect();

        let mut rng = XorShift64::new(0x5A5A_5A5A_5A5A_5A5A);
        let values = (0..KEY_COUNT)
            .map(|_| (0..value_size).map(|_| rng.next_u64() as u8).collect())
            .collect();

        Workload { keys, values }
    }
}

/// Zero-padded hex of `idx`, so keys stay printable and distinct.
fn bench_key(idx: usize, key_size: usize) -> String {
    format!("{idx:0width$x}", width = key_size.max(MIN_KEY_SIZE))
}

type Op = fn(&Client, &Workload, usize) -> Result<(), ClientError>;

#[derive(Debug, Serialize)]
struct PhaseReport {
    label: &'static str,
    ops: usize,
    misses: usize,
    errors: usize,
    secs: f64,
    ops_per_sec: f64,
    micros_per_op: f64,
}

impl PhaseReport {
    fn new(label: &'static str, ops: usize, misses: usize, errors: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        PhaseReport {
            label,
            ops,
            misses,
            errors,
            secs,
            ops_per_sec: (ops as f64) / secs,
            micros_per_op: (secs * 1e6) / (ops as f64),
        }
    }

    fn print(&self) {
        println!(
            "{}: {} ops in {:.3}s ({:.0} ops/s, {:.1} us/op, {} misses, {} errors)",
            self.label,
            self.ops,
            self.secs,
            self.ops_per_sec,
            self.micros_per_op,
            self.misses,
            self.errors
        );
    }
}

fn run_phase(
    label: &'static str,
    client: &Client,
    workload: &Arc<Workload>,
    config: &BenchConfig,
    seed: u64,
    op: Op,
) -> PhaseReport {
    let per_thread = config.op_count / config.threads;
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|worker| {
            let client = client.clone();
            let workload = Arc::clone(workload);
            thread::spawn(move || {
                let mut rng = XorShift64::new(seed ^ (worker as u64 + 1));
                let (mut misses, mut errors) = (0usize, 0usize);
                for _ in 0..per_thread {
                    let idx = rng.next_index(KEY_COUNT - 1);
                    match op(&client, &workload, idx) {
                        Ok(()) => {}
                        Err(ClientError::CacheMiss) => misses += 1,
                        Err(err) => {
                            if errors == 0 {
                                warn!(phase = label, error = %err, "operation failed");
                            }
                            errors += 1;
                        }
                    }
                }
                (misses, errors)
            })
        })
        .collect();

    let (mut misses, mut errors) = (0, 0);
    for worker in workers {
        // A panicked worker counts all of its operations as errors.
        let (m, e) = worker.join().unwrap_or((0, per_thread));
        misses += m;
        errors += e;
    }

    PhaseReport::new(label, per_thread * config.threads, misses, errors, start.elapsed())
}

fn op_set(client: &Client, workload: &Workload, idx: usize) -> Result<(), ClientError> {
    let item = Item::new(workload.keys[idx].as_str(), workload.values[idx].as_slice());
    client.set(&item)
}

fn op_get(client: &Client, workload: &Workload, idx: usize) -> Result<(), ClientError> {
    let item = client.get(&workload.keys[idx])?;
    black_box(item);
    Ok(())
}

fn op_meta_set(client: &Client, workload: &Workload, idx: usize) -> Result<(), ClientError> {
    let opts = MetaSetOptions {
        set_ttl: Some(300),
        ..MetaSetOptions::new(workload.keys[idx].as_str(), workload.values[idx].as_slice())
    };
    client.meta_set(&opts).map(|_| ())
}

fn op_meta_get(client: &Client, workload: &Workload, idx: usize) -> Result<(), ClientError> {
    let opts = MetaGetOptions {
        return_value: true,
        return_cas: true,
        ..MetaGetOptions::new(workload.keys[idx].as_str())
    };
    let result = client.meta_get(&opts)?;
    black_box(result);
    Ok(())
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = run() {
        eprintln!("mc-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let client = Client::with_config(config.client.clone())
        .with_context(|| format!("connecting to {}", config.client.addr))?;
    let version = client.version().context("querying server version")?;
    info!(addr = %config.client.addr, %version, "connected");

    let workload = Arc::new(Workload::build(config.key_size, config.value_size));
    for idx in 0..KEY_COUNT {
        op_set(&client, &workload, idx).context("preloading keys")?;
    }

    if !config.json {
        println!(
            "server={} version={} keys={} ops={} threads={} key_size={} value_size={}",
            config.client.addr,
            version,
            KEY_COUNT,
            config.op_count,
            config.threads,
            config.key_size,
            config.value_size
        );
    }

    let phases: [(&'static str, u64, Op); 4] = [
        ("SET", 0x0FED_CBA9_8765_4321, op_set),
        ("GET", 0x1234_5678_9ABC_DEF0, op_get),
        ("MS", 0x0BAD_F00D_DEAD_BEEF, op_meta_set),
        ("MG", 0x0DDB_A11C_AFE0_1234, op_meta_get),
    ];
    let mut reports = Vec::with_capacity(phases.len());
    for (label, seed, op) in phases {
        let report = run_phase(label, &client, &workload, &config, seed, op);
        if !config.json {
            report.print();
        }
        reports.push(report);
    }

    if config.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    let stats = client.pool_stats();
    info!(idle = stats.idle, total = stats.total, "pool at exit");
    client.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn keys_stay_distinct_at_the_smallest_size() {
        for key_size in [1, MIN_KEY_SIZE, DEFAULT_KEY_SIZE] {
            let keys: HashSet<String> =
                (0..KEY_COUNT).map(|idx| bench_key(idx, key_size)).collect();
            assert_eq!(keys.len(), KEY_COUNT, "key_size {key_size}");
        }
        assert_eq!(bench_key(KEY_COUNT - 1, MIN_KEY_SIZE), "fff");
        assert_eq!(bench_key(1, DEFAULT_KEY_SIZE).len(), DEFAULT_KEY_SIZE);
    }
}
