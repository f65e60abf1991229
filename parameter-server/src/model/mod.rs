//! Server-side consistency models.
//!
//! Every shard hosts one [`ConsistencyModel`] per table. The model owns the
//! shard's [`Storage`], its [`PendingBuffer`] and the per-sender clocks, and is
//! only ever touched by the shard's processing thread.
//!
//! | model       | Add            | Get                                    |
//! |-------------|----------------|----------------------------------------|
//! | ASP         | applied now    | answered now                           |
//! | BSP         | applied once the minimum clock reaches its tag | answered once the minimum reaches the reader's clock |
//! | SSP(S)      | applied now    | answered once `min >= clock - S`       |
//! | Sparse-SSP  | applied now, recorded per key | as SSP, or early when the keys' recent writes are sparse |

mod asp;
mod bsp;
pub mod recorder;
mod sparse_ssp;
mod ssp;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use asp::AspModel;
pub use bsp::BspModel;
pub use sparse_ssp::SparseSspModel;
pub use ssp::SspModel;

use crate::config::TableConfig;
use crate::error::{PsError, Result};
use crate::message::{ArrayBlock, Clock, Message, Op, TableId, ThreadId, Value};
use crate::pending::PendingBuffer;
use crate::progress::ProgressTracker;
use crate::store::Storage;
use crate::topology::KeyRange;

use recorder::Recorder;

/// Consistency policy of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Asynchronous: no synchronization at all.
    Asp,
    /// Bulk synchronous: every Get waits for the barrier.
    Bsp,
    /// Stale synchronous with a staleness bound.
    Ssp,
    /// Stale synchronous with per-key speculation.
    SparseSsp,
}

/// Snapshot of one table on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    pub table_id: TableId,
    pub model: ModelKind,
    pub min_clock: Clock,
    /// Workers the shard currently tracks.
    pub workers: usize,
    /// Messages parked in the pending buffer.
    pub buffered: usize,
    /// Keys materialised in storage.
    pub stored_keys: usize,
}

/// State shared by all models: storage, buffered messages and clocks.
pub struct ShardState<V> {
    pub table_id: TableId,
    pub shard_id: ThreadId,
    pub range: KeyRange,
    pub storage: Storage<V>,
    pub pending: PendingBuffer,
    pub progress: ProgressTracker,
}

impl<V: Value> ShardState<V> {
    /// Fresh state with open membership and nothing buffered.
    pub fn new(table_id: TableId, shard_id: ThreadId, range: KeyRange, storage: Storage<V>) -> Self {
        Self {
            table_id,
            shard_id,
            range,
            storage,
            pending: PendingBuffer::new(),
            progress: ProgressTracker::new(),
        }
    }

    /// Smallest clock across the table's workers on this shard.
    pub fn min_clock(&self) -> Clock {
        self.progress.min_clock()
    }

    fn check_keys(&self, msg: &Message) -> Result<()> {
        let keys = msg.keys()?;
        if !keys.windows(2).all(|w| w[0] <= w[1]) {
            return Err(PsError::malformed(format!(
                "keys from {} are not sorted",
                msg.sender
            )));
        }
        if let Some(&key) = keys.iter().find(|&&k| !self.range.contains(k)) {
            return Err(PsError::malformed(format!(
                "key {key} is outside shard {} range {}",
                self.shard_id, self.range
            )));
        }
        Ok(())
    }

    /// Checks an Add is applicable as a whole, then admits its sender.
    ///
    /// A rejected Add leaves no trace: an unseen sender is only tracked once
    /// its message has passed every check.
    pub fn validate_add(&mut self, msg: &Message) -> Result<()> {
        self.progress.check_member(msg.sender)?;
        self.check_keys(msg)?;
        let (keys, values) = (msg.keys()?, msg.values::<V>()?);
        if keys.len() != values.len() {
            return Err(PsError::malformed(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        self.progress.admit(msg.sender)
    }

    /// Checks a Get's keys, then admits its sender.
    pub fn validate_get(&mut self, msg: &Message) -> Result<()> {
        self.progress.check_member(msg.sender)?;
        self.check_keys(msg)?;
        self.progress.admit(msg.sender)
    }

    /// Applies a validated Add to storage.
    pub fn apply_add(&mut self, msg: &Message) -> Result<()> {
        self.storage.add_batch(msg.keys()?, msg.values::<V>()?)
    }

    /// Reads the requested keys and builds the response.
    pub fn answer_get(&self, msg: &Message) -> Result<Message> {
        let keys = msg.keys()?;
        let values = self.storage.get_batch(keys)?;
        Ok(msg
            .reply()
            .with_block(ArrayBlock::Keys(keys.to_vec()))
            .with_block(V::into_block(values)))
    }

    /// Answers a batch of released messages, logging the ones that fail.
    pub fn answer_all(&self, msgs: Vec<Message>) -> Vec<Message> {
        if !msgs.is_empty() {
            debug!(
                table_id = self.table_id,
                shard_id = self.shard_id,
                min_clock = self.min_clock(),
                released = msgs.len(),
                "releasing buffered gets"
            );
        }
        msgs.iter()
            .filter_map(|msg| match self.answer_get(msg) {
                Ok(resp) => Some(resp),
                Err(err) => {
                    warn!(table_id = self.table_id, sender = msg.sender, error = %err, "dropping buffered get");
                    None
                }
            })
            .collect()
    }

    /// Pins the worker set carried in the key block and acknowledges it.
    pub fn reset_workers(&mut self, msg: &Message) -> Result<Message> {
        let workers = msg
            .keys()?
            .iter()
            .map(|&w| ThreadId::try_from(w).map_err(|_| PsError::malformed(format!("bad worker id {w}"))))
            .collect::<Result<Vec<_>>>()?;
        self.progress.reset(&workers);
        Ok(msg.reply())
    }

    fn status(&self, model: ModelKind) -> TableStatus {
        TableStatus {
            table_id: self.table_id,
            model,
            min_clock: self.min_clock(),
            workers: self.progress.num_workers(),
            buffered: self.pending.len(),
            stored_keys: self.storage.len(),
        }
    }
}

/// A table's consistency policy on one shard.
pub enum ConsistencyModel<V> {
    Asp(AspModel<V>),
    Bsp(BspModel<V>),
    Ssp(SspModel<V>),
    SparseSsp(SparseSspModel<V>),
}

impl<V: Value> ConsistencyModel<V> {
    /// Builds the model and storage `config` asks for over `range`.
    ///
    /// Fails with [`PsError::Config`] when the config is inconsistent or a
    /// dense layout cannot cover `range`.
    pub fn new(
        config: &TableConfig,
        table_id: TableId,
        shard_id: ThreadId,
        range: KeyRange,
    ) -> Result<Self> {
        config.validate()?;
        let state = ShardState::new(table_id, shard_id, range, Storage::new(config.storage, range)?);
        Ok(match config.model {
            ModelKind::Asp => ConsistencyModel::Asp(AspModel::new(state)),
            ModelKind::Bsp => ConsistencyModel::Bsp(BspModel::new(state)),
            ModelKind::Ssp => ConsistencyModel::Ssp(SspModel::new(state, config.staleness)),
            ModelKind::SparseSsp => {
                let kind = config
                    .recorder
                    .ok_or_else(|| PsError::config("sparse SSP needs a recorder"))?;
                ConsistencyModel::SparseSsp(SparseSspModel::new(
                    state,
                    config.staleness,
                    config.speculation,
                    Recorder::new(kind, range)?,
                ))
            }
        })
    }

    /// Which consistency policy this is.
    pub fn kind(&self) -> ModelKind {
        match self {
            ConsistencyModel::Asp(_) => ModelKind::Asp,
            ConsistencyModel::Bsp(_) => ModelKind::Bsp,
            ConsistencyModel::Ssp(_) => ModelKind::Ssp,
            ConsistencyModel::SparseSsp(_) => ModelKind::SparseSsp,
        }
    }

    /// Shared state, for status reporting and tests.
    pub fn state(&self) -> &ShardState<V> {
        match self {
            ConsistencyModel::Asp(m) => &m.state,
            ConsistencyModel::Bsp(m) => &m.state,
            ConsistencyModel::Ssp(m) => &m.state,
            ConsistencyModel::SparseSsp(m) => &m.state,
        }
    }

    fn state_mut(&mut self) -> &mut ShardState<V> {
        match self {
            ConsistencyModel::Asp(m) => &mut m.state,
            ConsistencyModel::Bsp(m) => &mut m.state,
            ConsistencyModel::Ssp(m) => &mut m.state,
            ConsistencyModel::SparseSsp(m) => &mut m.state,
        }
    }

    /// Applies or buffers an Add. Rejected Adds change nothing.
    pub fn on_add(&mut self, msg: Message) -> Result<()> {
        match self {
            ConsistencyModel::Asp(m) => m.on_add(msg),
            ConsistencyModel::Bsp(m) => m.on_add(msg),
            ConsistencyModel::Ssp(m) => m.on_add(msg),
            ConsistencyModel::SparseSsp(m) => m.on_add(msg),
        }
    }

    /// Returns the response, or `None` when the Get was buffered.
    pub fn on_get(&mut self, msg: Message) -> Result<Option<Message>> {
        match self {
            ConsistencyModel::Asp(m) => m.on_get(msg),
            ConsistencyModel::Bsp(m) => m.on_get(msg),
            ConsistencyModel::Ssp(m) => m.on_get(msg),
            ConsistencyModel::SparseSsp(m) => m.on_get(msg),
        }
    }

    /// Returns the responses for every Get the clock released.
    pub fn on_clock(&mut self, msg: Message) -> Result<Vec<Message>> {
        match self {
            ConsistencyModel::Asp(m) => m.on_clock(msg),
            ConsistencyModel::Bsp(m) => m.on_clock(msg),
            ConsistencyModel::Ssp(m) => m.on_clock(msg),
            ConsistencyModel::SparseSsp(m) => m.on_clock(msg),
        }
    }

    /// Pins the worker set and returns the acknowledgement.
    pub fn on_reset(&mut self, msg: Message) -> Result<Message> {
        self.state_mut().reset_workers(&msg)
    }
}

/// Object-safe view of a model, so one shard can host tables of different
/// value types.
pub trait ShardTable: Send {
    /// Processes one inbound message and returns the messages to send back.
    fn handle(&mut self, msg: Message) -> Result<Vec<Message>>;

    /// Current clocks, buffer size and storage size.
    fn status(&self) -> TableStatus;
}

impl<V: Value> ShardTable for ConsistencyModel<V> {
    fn handle(&mut self, msg: Message) -> Result<Vec<Message>> {
        match msg.op {
            Op::Add => self.on_add(msg).map(|()| Vec::new()),
            Op::Get => self.on_get(msg).map(|resp| resp.into_iter().collect()),
            Op::Clock => self.on_clock(msg),
            Op::ResetWorkers => self.on_reset(msg).map(|ack| vec![ack]),
            Op::Response => Err(PsError::malformed(format!(
                "shard received a response from {}",
                msg.sender
            ))),
        }
    }

    fn status(&self) -> TableStatus {
        self.state().status(self.kind())
    }
}
