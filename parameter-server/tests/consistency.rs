//! Integration tests for the consistency models with several workers.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parameter_server::{
    Engine, EngineConfig, Key, KvClientTable, PsError, RecorderKind, StorageKind, TableConfig,
};

const TABLE: u32 = 1;
const SHORT: Duration = Duration::from_millis(100);

/// A running engine with one table and a pinned set of workers.
struct TestCluster {
    engine: Engine,
    workers: Vec<u32>,
}

impl TestCluster {
    fn spawn(config: TableConfig, num_keys: Key, num_workers: u32) -> Result<Self> {
        let mut engine = Engine::start(EngineConfig {
            num_shards: 3,
            first_shard_id: 0,
            ..EngineConfig::default()
        })?;
        engine.create_table_even::<f64>(TABLE, num_keys, config)?;
        let workers: Vec<u32> = (100..100 + num_workers).collect();
        engine.init_table(TABLE, &workers)?;
        Ok(Self { engine, workers })
    }

    fn table(&self, worker: usize) -> Result<KvClientTable<f64>> {
        Ok(self.engine.table::<f64>(self.workers[worker], TABLE)?)
    }

    fn shutdown(self) -> Result<()> {
        self.engine.shutdown()?;
        Ok(())
    }
}

fn is_timeout<T: std::fmt::Debug>(result: parameter_server::Result<T>) -> bool {
    matches!(result, Err(PsError::Timeout { .. }))
}

#[test]
fn test_bsp_get_waits_for_the_slowest_worker() -> Result<()> {
    let cluster = TestCluster::spawn(TableConfig::bsp(StorageKind::Dense), 30, 2)?;
    let mut a = cluster.table(0)?;
    let mut b = cluster.table(1)?;

    a.add(&[5, 25], &[1.0, 1.0])?;
    a.clock()?;
    assert!(is_timeout(a.get_with_timeout(&[5, 25], SHORT)));

    b.add(&[5], &[2.0])?;
    b.clock()?;
    // Both iteration-0 updates are visible once B has clocked.
    assert_eq!(a.get(&[5, 25])?, vec![3.0, 1.0]);

    drop((a, b));
    cluster.shutdown()
}

#[test]
fn test_bsp_never_exposes_the_next_iteration() -> Result<()> {
    let cluster = TestCluster::spawn(TableConfig::bsp(StorageKind::Sparse), 30, 2)?;
    let mut a = cluster.table(0)?;
    let mut b = cluster.table(1)?;

    // B finishes iteration 0 and writes during iteration 1.
    b.clock()?;
    b.add(&[7], &[10.0])?;
    // B's Get at clock 1 waits for A, which also orders B's add on the shard.
    assert!(is_timeout(b.get_with_timeout(&[7], SHORT)));

    // A is still at clock 0 and must not see B's iteration-1 write.
    assert_eq!(a.get(&[7])?, vec![0.0]);
    a.clock()?;
    assert_eq!(a.get(&[7])?, vec![10.0]);

    drop((a, b));
    cluster.shutdown()
}

#[test]
fn test_ssp_allows_bounded_lead() -> Result<()> {
    let cluster = TestCluster::spawn(TableConfig::ssp(StorageKind::Sparse, 1), 30, 2)?;
    let mut fast = cluster.table(0)?;
    let mut slow = cluster.table(1)?;

    fast.clock()?;
    // One iteration ahead: within the bound.
    assert_eq!(fast.get_with_timeout(&[3], SHORT)?, vec![0.0]);
    fast.clock()?;
    // Two ahead: blocked.
    assert!(is_timeout(fast.get_with_timeout(&[3], SHORT)));

    slow.add(&[3], &[4.0])?;
    slow.clock()?;
    assert_eq!(fast.get(&[3])?, vec![4.0]);

    drop((fast, slow));
    cluster.shutdown()
}

#[test]
fn test_sparse_ssp_reads_quiet_keys_ahead_of_the_bound() -> Result<()> {
    let config = TableConfig::sparse_ssp(StorageKind::Dense, 0, 1, RecorderKind::Sparse);
    let cluster = TestCluster::spawn(config, 30, 2)?;
    let mut a = cluster.table(0)?;
    let mut b = cluster.table(1)?;

    b.add(&[12], &[1.0])?;
    // Reading back through the same shard orders the add before A's reads.
    assert_eq!(b.get(&[12])?, vec![1.0]);

    a.clock()?;
    // Key 2 has no concurrent writers, so A may read it at once.
    assert_eq!(a.get_with_timeout(&[2], SHORT)?, vec![0.0]);
    // Key 12 was written by B in an iteration A is ahead of.
    assert!(is_timeout(a.get_with_timeout(&[12], SHORT)));

    b.clock()?;
    assert_eq!(a.get(&[12])?, vec![1.0]);

    drop((a, b));
    cluster.shutdown()
}

/// Runs `workers` threads that each read every key, add 1 to every key and
/// clock, `iterations` times. Returns, per worker, the smallest value seen
/// at each clock.
fn run_iterations(
    cluster: &TestCluster,
    keys: &[Key],
    iterations: u64,
) -> Result<Vec<Vec<f64>>> {
    let mut handles = Vec::new();
    for w in 0..cluster.workers.len() {
        let mut table = cluster.table(w)?;
        let keys = keys.to_vec();
        handles.push(thread::spawn(move || -> Result<Vec<f64>> {
            let mut seen = Vec::new();
            for _ in 0..iterations {
                let values = table.get(&keys)?;
                seen.push(values.iter().copied().fold(f64::INFINITY, f64::min));
                table.add(&keys, &vec![1.0; keys.len()])?;
                table.clock()?;
            }
            Ok(seen)
        }));
    }
    handles
        .into_iter()
        .map(|h| h.join().map_err(|_| anyhow!("worker panicked"))?)
        .collect()
}

#[test]
fn test_bsp_reads_see_exactly_the_finished_iterations() -> Result<()> {
    let cluster = TestCluster::spawn(TableConfig::bsp(StorageKind::Dense), 12, 4)?;
    let keys: Vec<Key> = (0..12).collect();
    let workers = cluster.workers.len() as f64;

    for seen in run_iterations(&cluster, &keys, 8)? {
        for (clock, min) in seen.into_iter().enumerate() {
            let done = clock as f64 * workers;
            assert!(min >= done, "clock {clock}: saw {min}, expected at least {done}");
            assert!(min < done + workers, "clock {clock}: saw {min}, beyond the barrier");
        }
    }

    let mut reader = cluster.table(0)?;
    // The reader starts at clock 0, which every worker has passed.
    assert!(reader.get(&keys)?.iter().all(|&v| v == 32.0));
    drop(reader);
    cluster.shutdown()
}

#[test]
fn test_ssp_reads_respect_the_staleness_bound() -> Result<()> {
    let staleness = 2;
    let cluster = TestCluster::spawn(TableConfig::ssp(StorageKind::Sparse, staleness), 9, 3)?;
    let keys: Vec<Key> = (0..9).collect();
    let workers = cluster.workers.len() as f64;

    for seen in run_iterations(&cluster, &keys, 10)? {
        for (clock, min) in seen.into_iter().enumerate() {
            let floor = clock.saturating_sub(staleness as usize) as f64 * workers;
            assert!(min >= floor, "clock {clock}: saw {min}, expected at least {floor}");
        }
    }
    cluster.shutdown()
}

#[test]
fn test_asp_totals_are_exact_after_concurrent_updates() -> Result<()> {
    let cluster = TestCluster::spawn(TableConfig::asp(StorageKind::Sparse), 6, 4)?;
    let keys: Vec<Key> = (0..6).collect();
    run_iterations(&cluster, &keys, 5)?;

    let mut reader = cluster.table(1)?;
    assert_eq!(reader.get(&keys)?, vec![20.0; 6]);
    drop(reader);
    cluster.shutdown()
}
