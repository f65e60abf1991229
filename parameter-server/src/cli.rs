use clap::Parser;

use crate::config::{EngineConfig, TableConfig};
use crate::error::{PsError, Result};
use crate::model::recorder::RecorderKind;
use crate::model::ModelKind;
use crate::store::StorageKind;

/// Runs an iterative sparse-update workload against a local engine.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of shard threads.
    #[arg(long, default_value_t = 2)]
    pub shards: usize,

    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    pub workers: u32,

    /// Size of the key space, split evenly across the shards.
    #[arg(long, default_value_t = 1000)]
    pub keys: u64,

    /// Iterations each worker runs; one Clock per iteration.
    #[arg(long, default_value_t = 20)]
    pub iterations: u64,

    /// Keys each worker updates per iteration.
    #[arg(long, default_value_t = 16)]
    pub batch: usize,

    #[arg(long, value_enum, default_value_t = ModelKind::Ssp)]
    pub model: ModelKind,

    #[arg(long, value_enum, default_value_t = StorageKind::Dense)]
    pub storage: StorageKind,

    /// Staleness bound for the SSP models.
    #[arg(long, default_value_t = 1)]
    pub staleness: u64,

    /// Speculation threshold for sparse SSP.
    #[arg(long, default_value_t = 0)]
    pub speculation: usize,

    /// Write recorder for sparse SSP.
    #[arg(long, value_enum)]
    pub recorder: Option<RecorderKind>,

    /// Serialize every message through the wire codec.
    #[arg(long)]
    pub wire_codec: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Engine settings from the shard flags.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            num_shards: self.shards,
            wire_codec: self.wire_codec,
            ..EngineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// The table configuration the flags describe. Flags that do not apply
    /// to the chosen model are ignored.
    pub fn table_config(&self) -> Result<TableConfig> {
        let config = match self.model {
            ModelKind::Asp => TableConfig::asp(self.storage),
            ModelKind::Bsp => TableConfig::bsp(self.storage),
            ModelKind::Ssp => TableConfig::ssp(self.storage, self.staleness),
            ModelKind::SparseSsp => TableConfig::sparse_ssp(
                self.storage,
                self.staleness,
                self.speculation,
                self.recorder.unwrap_or(RecorderKind::Sparse),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Worker thread ids, placed after the shard ids.
    pub fn worker_ids(&self) -> Result<Vec<u32>> {
        let first = u32::try_from(self.shards)
            .map_err(|_| PsError::config(format!("{} shards is too many", self.shards)))?;
        Ok((0..self.workers).map(|i| first + i).collect())
    }
}
