//! Iterative sparse-update workload on a local parameter server.
//!
//! Every worker repeatedly reads a random batch of keys, adds `1.0` to each
//! of them and advances its clock. Once all workers are done, the table must
//! hold exactly the number of updates each key received.
//!
//! ```bash
//! cargo run --bin ps-demo -- --shards 4 --workers 8 --model bsp
//! RUST_LOG=parameter_server=debug cargo run --bin ps-demo -- --model sparse-ssp --speculation 2
//! ```

use std::collections::HashMap;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rand::seq::index;
use tracing::{debug, info};

use parameter_server::cli::Cli;
use parameter_server::{Engine, Key, KvClientTable, TableId};

const TABLE: TableId = 0;

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Runs one worker's iterations and returns its handle plus the number of
/// updates it made to each key.
fn run_worker(
    mut table: KvClientTable<f64>,
    keys: u64,
    batch: usize,
    iterations: u64,
) -> Result<(KvClientTable<f64>, HashMap<Key, f64>)> {
    let mut rng = rand::thread_rng();
    let mut updates: HashMap<Key, f64> = HashMap::new();
    let amount = batch.min(keys as usize);
    for iteration in 0..iterations {
        let mut chosen: Vec<Key> = index::sample(&mut rng, keys as usize, amount)
            .into_iter()
            .map(|i| i as Key)
            .collect();
        chosen.sort_unstable();

        let seen = table
            .get(&chosen)
            .with_context(|| format!("worker {} get failed", table.app_thread_id()))?;
        debug!(
            worker = table.app_thread_id(),
            iteration,
            sum = seen.iter().sum::<f64>(),
            "read batch"
        );

        table.add(&chosen, &vec![1.0; chosen.len()])?;
        for &key in &chosen {
            *updates.entry(key).or_default() += 1.0;
        }
        table.clock()?;
    }
    Ok((table, updates))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let table_config = cli.table_config()?;
    let mut engine = Engine::start(cli.engine_config()?).context("failed to start engine")?;
    engine.create_table_even::<f64>(TABLE, cli.keys, table_config)?;
    let workers = cli.worker_ids()?;
    engine.init_table(TABLE, &workers)?;

    info!(
        model = ?table_config.model,
        storage = ?table_config.storage,
        shards = cli.shards,
        workers = workers.len(),
        iterations = cli.iterations,
        "starting workload"
    );
    let started = Instant::now();

    let mut handles = Vec::with_capacity(workers.len());
    for &worker in &workers {
        let table = engine.table::<f64>(worker, TABLE)?;
        let (keys, batch, iterations) = (cli.keys, cli.batch, cli.iterations);
        let handle = thread::Builder::new()
            .name(format!("ps-worker-{worker}"))
            .spawn(move || run_worker(table, keys, batch, iterations))
            .context("failed to spawn worker")?;
        handles.push(handle);
    }

    let mut expected: HashMap<Key, f64> = HashMap::new();
    let mut reader = None;
    for handle in handles {
        let (table, updates) = handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
        for (key, count) in updates {
            *expected.entry(key).or_default() += count;
        }
        reader.get_or_insert(table);
    }
    let mut reader = reader.context("no workers ran")?;
    let elapsed = started.elapsed();

    let all_keys: Vec<Key> = (0..cli.keys).collect();
    let values = reader.get(&all_keys)?;
    let mismatched = all_keys
        .iter()
        .zip(&values)
        .filter(|(key, value)| expected.get(*key).copied().unwrap_or(0.0) != **value)
        .count();

    for (shard, tables) in engine.status()? {
        for status in tables {
            info!(
                shard,
                table_id = status.table_id,
                min_clock = status.min_clock,
                buffered = status.buffered,
                stored_keys = status.stored_keys,
                "shard status"
            );
        }
    }
    drop(reader);
    engine.shutdown()?;

    if mismatched > 0 {
        bail!("{mismatched} of {} keys disagree with the applied updates", cli.keys);
    }
    info!(
        total = values.iter().sum::<f64>(),
        elapsed_ms = elapsed.as_millis() as u64,
        "all updates accounted for"
    );
    Ok(())
}
