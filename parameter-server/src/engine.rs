//! Local engine: owns the shard threads and the table registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{info, warn};

use crate::client::KvClientTable;
use crate::config::{EngineConfig, TableConfig};
use crate::error::{PsError, Result};
use crate::message::{ArrayBlock, Key, Message, Op, TableId, ThreadId, Value};
use crate::model::{ConsistencyModel, TableStatus};
use crate::runtime::{spawn_shard, ShardHandle};
use crate::topology::{KeyRange, RangeRouter};
use crate::transport::{Mailbox, Transport};

/// Thread id the engine itself uses when it talks to shards.
const CONTROL_THREAD: ThreadId = ThreadId::MAX;

/// How long [`Engine::init_table`] waits for shards to acknowledge.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

struct TableEntry {
    router: Arc<RangeRouter>,
    config: TableConfig,
    value_type: &'static str,
}

/// A set of shard threads plus the tables created on them.
///
/// Worker handles come from [`Engine::table`] and are moved into the worker
/// threads; the engine itself stays on the thread that created it.
pub struct Engine {
    config: EngineConfig,
    mailbox: Arc<Mailbox>,
    shards: Vec<ShardHandle>,
    tables: HashMap<TableId, TableEntry>,
}

impl Engine {
    /// Spawns one processing thread per shard.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mailbox = Arc::new(if config.wire_codec {
            Mailbox::encoded()
        } else {
            Mailbox::new()
        });
        let transport: Arc<dyn Transport> = mailbox.clone();
        let mut shards = Vec::with_capacity(config.num_shards);
        for shard_id in config.shard_ids() {
            let queue = mailbox.register_shard(shard_id)?;
            shards.push(spawn_shard(shard_id, transport.clone(), queue)?);
        }
        info!(num_shards = config.num_shards, first_shard_id = config.first_shard_id, "engine started");
        Ok(Self {
            config,
            mailbox,
            shards,
            tables: HashMap::new(),
        })
    }

    /// Ids of the shard threads, in shard order.
    pub fn shard_ids(&self) -> Vec<ThreadId> {
        self.config.shard_ids()
    }

    /// Creates a table with one range per shard, in shard order.
    ///
    /// Config errors, including dense layouts too wide to allocate, are
    /// returned here before any shard has registered the table.
    pub fn create_table<V: Value>(
        &mut self,
        table_id: TableId,
        ranges: Vec<KeyRange>,
        config: TableConfig,
    ) -> Result<Arc<RangeRouter>> {
        config.validate()?;
        if self.tables.contains_key(&table_id) {
            return Err(PsError::config(format!("table {table_id} already exists")));
        }
        if ranges.len() != self.shards.len() {
            return Err(PsError::config(format!(
                "table {table_id} has {} ranges for {} shards",
                ranges.len(),
                self.shards.len()
            )));
        }
        let router = Arc::new(RangeRouter::new(ranges, self.shard_ids())?);
        // Every model is built before any shard sees the table, so a
        // layout that cannot be allocated leaves no shard half-registered.
        let models = self
            .shards
            .iter()
            .zip(router.ranges())
            .map(|(shard, &range)| ConsistencyModel::<V>::new(&config, table_id, shard.shard_id(), range))
            .collect::<Result<Vec<_>>>()?;
        for (shard, model) in self.shards.iter().zip(models) {
            shard.register_table(table_id, Box::new(model))?;
        }
        info!(
            table_id,
            model = ?config.model,
            storage = ?config.storage,
            value_type = V::TYPE_NAME,
            "table created"
        );
        self.tables.insert(
            table_id,
            TableEntry {
                router: router.clone(),
                config,
                value_type: V::TYPE_NAME,
            },
        );
        Ok(router)
    }

    /// Creates a table over `[0, num_keys)` split evenly across the shards.
    pub fn create_table_even<V: Value>(
        &mut self,
        table_id: TableId,
        num_keys: Key,
        config: TableConfig,
    ) -> Result<Arc<RangeRouter>> {
        let ranges = RangeRouter::even(num_keys, self.shard_ids())?.ranges().to_vec();
        self.create_table::<V>(table_id, ranges, config)
    }

    fn entry(&self, table_id: TableId) -> Result<&TableEntry> {
        self.tables
            .get(&table_id)
            .ok_or_else(|| PsError::config(format!("table {table_id} does not exist")))
    }

    /// The key-range layout of `table_id`.
    pub fn router(&self, table_id: TableId) -> Result<Arc<RangeRouter>> {
        self.entry(table_id).map(|t| t.router.clone())
    }

    /// The configuration `table_id` was created with.
    pub fn table_config(&self, table_id: TableId) -> Result<TableConfig> {
        self.entry(table_id).map(|t| t.config)
    }

    /// Pins the set of workers every shard of the table expects clocks from.
    ///
    /// Blocks until all shards have acknowledged. Call it before any worker
    /// touches the table.
    pub fn init_table(&self, table_id: TableId, workers: &[ThreadId]) -> Result<()> {
        let router = self.router(table_id)?;
        if let Some(&w) = workers.iter().find(|&&w| self.is_reserved(w)) {
            return Err(PsError::config(format!("worker id {w} is reserved")));
        }
        let inbox = self.mailbox.register_inbox(CONTROL_THREAD, table_id)?;
        let result = (|| -> Result<()> {
            let block = ArrayBlock::Keys(workers.iter().map(|&w| Key::from(w)).collect());
            for &shard in router.shard_ids() {
                let msg = Message::new(Op::ResetWorkers, CONTROL_THREAD, shard, table_id)
                    .with_block(block.clone());
                self.mailbox.send(msg)?;
            }
            let mut pending: HashSet<ThreadId> = router.shard_ids().iter().copied().collect();
            while !pending.is_empty() {
                let ack = inbox.recv_timeout(ACK_TIMEOUT).map_err(|err| match err {
                    RecvTimeoutError::Timeout => PsError::Timeout { request_id: 0 },
                    RecvTimeoutError::Disconnected => {
                        PsError::Transport("control inbox closed".into())
                    }
                })?;
                if !pending.remove(&ack.sender) {
                    return Err(PsError::protocol(format!(
                        "unexpected acknowledgement from shard {}",
                        ack.sender
                    )));
                }
            }
            Ok(())
        })();
        self.mailbox.deregister_inbox(CONTROL_THREAD, table_id);
        if result.is_ok() {
            info!(table_id, workers = workers.len(), "workers registered");
        }
        result
    }

    fn is_reserved(&self, thread: ThreadId) -> bool {
        thread == CONTROL_THREAD || self.shard_ids().contains(&thread)
    }

    /// Hands out the client table for one worker thread.
    pub fn table<V: Value>(&self, app_thread_id: ThreadId, table_id: TableId) -> Result<KvClientTable<V>> {
        let entry = self.entry(table_id)?;
        if entry.value_type != V::TYPE_NAME {
            return Err(PsError::config(format!(
                "table {table_id} stores {}, not {}",
                entry.value_type,
                V::TYPE_NAME
            )));
        }
        if self.is_reserved(app_thread_id) {
            return Err(PsError::config(format!(
                "worker id {app_thread_id} is reserved"
            )));
        }
        let inbox = self.mailbox.register_inbox(app_thread_id, table_id)?;
        Ok(KvClientTable::new(
            app_thread_id,
            table_id,
            entry.router.clone(),
            self.mailbox.clone(),
            inbox,
        ))
    }

    /// Status of every table on every shard.
    pub fn status(&self) -> Result<Vec<(ThreadId, Vec<TableStatus>)>> {
        let mut all = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            all.push((shard.shard_id(), shard.status()?));
        }
        Ok(all)
    }

    /// Stops every shard thread once its queue is drained.
    pub fn shutdown(mut self) -> Result<()> {
        let mut first_err = None;
        for shard in self.shards.drain(..) {
            let shard_id = shard.shard_id();
            if let Err(err) = shard.shutdown() {
                warn!(shard_id, error = %err, "shard shutdown failed");
                first_err.get_or_insert(err);
            }
            self.mailbox.deregister_shard(shard_id);
        }
        info!("engine stopped");
        first_err.map_or(Ok(()), Err)
    }
}
