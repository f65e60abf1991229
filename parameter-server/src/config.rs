//! Table and engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{PsError, Result};
use crate::message::{Clock, ThreadId};
use crate::model::recorder::RecorderKind;
use crate::model::ModelKind;
use crate::store::StorageKind;

/// How one table is stored and synchronized on every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub model: ModelKind,
    pub storage: StorageKind,
    /// Staleness bound `S` for the SSP models.
    pub staleness: Clock,
    /// Speculation threshold `K` for sparse SSP.
    pub speculation: usize,
    pub recorder: Option<RecorderKind>,
}

impl TableConfig {
    /// Asynchronous table: no synchronization.
    pub fn asp(storage: StorageKind) -> Self {
        Self {
            model: ModelKind::Asp,
            storage,
            staleness: 0,
            speculation: 0,
            recorder: None,
        }
    }

    /// Bulk synchronous table.
    pub fn bsp(storage: StorageKind) -> Self {
        Self {
            model: ModelKind::Bsp,
            ..Self::asp(storage)
        }
    }

    /// Stale synchronous table with bound `staleness`.
    pub fn ssp(storage: StorageKind, staleness: Clock) -> Self {
        Self {
            model: ModelKind::Ssp,
            staleness,
            ..Self::asp(storage)
        }
    }

    /// Sparse SSP: SSP with bound `staleness`, plus early reads of keys
    /// with fewer than `speculation` unsynchronized foreign writes.
    pub fn sparse_ssp(
        storage: StorageKind,
        staleness: Clock,
        speculation: usize,
        recorder: RecorderKind,
    ) -> Self {
        Self {
            model: ModelKind::SparseSsp,
            storage,
            staleness,
            speculation,
            recorder: Some(recorder),
        }
    }

    /// Rejects options that do not apply to the chosen model.
    ///
    /// Range-dependent limits, such as the width of a dense layout, are
    /// checked when the table is built on its shards.
    pub fn validate(&self) -> Result<()> {
        match (self.model, self.recorder) {
            (ModelKind::SparseSsp, None) => {
                return Err(PsError::config("sparse SSP needs a recorder"));
            }
            (ModelKind::SparseSsp, Some(_)) => {}
            (model, Some(_)) => {
                return Err(PsError::config(format!("{model:?} does not record writes")));
            }
            (model, None) if self.speculation > 0 => {
                return Err(PsError::config(format!("{model:?} does not speculate")));
            }
            _ => {}
        }
        if matches!(self.model, ModelKind::Asp | ModelKind::Bsp) && self.staleness > 0 {
            return Err(PsError::config(format!(
                "{:?} has no staleness bound",
                self.model
            )));
        }
        Ok(())
    }
}

/// Shape of a local engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub num_shards: usize,
    /// Thread id of the first shard; the rest follow consecutively.
    pub first_shard_id: ThreadId,
    /// Serialize every message on its way through the transport.
    pub wire_codec: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_shards: 2,
            first_shard_id: 0,
            wire_codec: false,
        }
    }
}

impl EngineConfig {
    /// Rejects an empty engine and shard ids that collide with the
    /// reserved control id.
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(PsError::config("an engine needs at least one shard"));
        }
        let last = u64::from(self.first_shard_id) + self.num_shards as u64 - 1;
        // The top id is reserved for the engine's own control inbox.
        if last >= u64::from(ThreadId::MAX) {
            return Err(PsError::config("shard ids overflow the thread id space"));
        }
        Ok(())
    }

    /// `num_shards` consecutive ids starting at `first_shard_id`.
    pub fn shard_ids(&self) -> Vec<ThreadId> {
        (0..self.num_shards as ThreadId)
            .map(|i| self.first_shard_id + i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_validate() {
        for config in [
            TableConfig::asp(StorageKind::Sparse),
            TableConfig::bsp(StorageKind::Dense),
            TableConfig::ssp(StorageKind::Sparse, 3),
            TableConfig::sparse_ssp(StorageKind::Dense, 1, 2, RecorderKind::Dense),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_mismatched_options_are_rejected() {
        let mut ssp = TableConfig::ssp(StorageKind::Sparse, 1);
        ssp.recorder = Some(RecorderKind::Sparse);
        assert!(matches!(ssp.validate(), Err(PsError::Config(_))));

        let mut bsp = TableConfig::bsp(StorageKind::Sparse);
        bsp.speculation = 4;
        assert!(bsp.validate().is_err());

        let mut asp = TableConfig::asp(StorageKind::Sparse);
        asp.staleness = 2;
        assert!(asp.validate().is_err());
    }

    #[test]
    fn test_engine_shard_ids_are_consecutive() {
        let config = EngineConfig {
            num_shards: 3,
            first_shard_id: 10,
            ..EngineConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.shard_ids(), vec![10, 11, 12]);
        assert!(EngineConfig {
            num_shards: 0,
            ..EngineConfig::default()
        }
        .validate()
        .is_err());
        assert!(EngineConfig {
            num_shards: 1,
            first_shard_id: ThreadId::MAX,
            ..EngineConfig::default()
        }
        .validate()
        .is_err());
    }
}
