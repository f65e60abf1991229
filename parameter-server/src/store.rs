//! Per-shard backing storage for one table.
//!
//! The storage is owned by the shard's consistency model, which is itself
//! driven by a single thread, so nothing here takes a lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PsError, Result};
use crate::message::{Key, Value};
use crate::topology::KeyRange;

/// Storage layout chosen at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Hash map; absent keys read as the default value.
    Sparse,
    /// Contiguous array covering the shard's whole range.
    Dense,
}

/// Widest range a dense layout may cover on one shard.
pub const MAX_DENSE_KEYS: u64 = 1 << 32;

/// Allocates one `fill` slot per key of `range`.
///
/// Fails with [`PsError::Config`] when the range is wider than
/// [`MAX_DENSE_KEYS`] or the allocation cannot be made, so an oversized
/// dense table is refused at creation instead of aborting the process.
pub(crate) fn dense_slots<T: Clone>(range: KeyRange, fill: T) -> Result<Vec<T>> {
    let width = range.width();
    if width > MAX_DENSE_KEYS {
        return Err(PsError::config(format!(
            "dense layout over {range} spans {width} keys, more than {MAX_DENSE_KEYS}"
        )));
    }
    let len = usize::try_from(width)
        .map_err(|_| PsError::config(format!("dense layout over {range} does not fit in memory")))?;
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(len)
        .map_err(|err| PsError::config(format!("cannot allocate dense layout over {range}: {err}")))?;
    slots.resize(len, fill);
    Ok(slots)
}

/// Values of one table on one shard, in the layout picked by [`StorageKind`].
pub enum Storage<V> {
    Sparse(HashMap<Key, V>),
    Dense { range: KeyRange, values: Vec<V> },
}

impl<V: Value> Storage<V> {
    /// Builds storage of the given layout over `range`.
    pub fn new(kind: StorageKind, range: KeyRange) -> Result<Self> {
        match kind {
            StorageKind::Sparse => Ok(Self::sparse()),
            StorageKind::Dense => Self::dense(range),
        }
    }

    /// Empty hash-map storage.
    pub fn sparse() -> Self {
        Storage::Sparse(HashMap::new())
    }

    /// Zero-filled storage for every key of `range`.
    pub fn dense(range: KeyRange) -> Result<Self> {
        Ok(Storage::Dense {
            range,
            values: dense_slots(range, V::default())?,
        })
    }

    fn offset(range: &KeyRange, key: Key) -> Result<usize> {
        if range.contains(key) {
            Ok((key - range.begin) as usize)
        } else {
            Err(PsError::KeyOutOfRange { key })
        }
    }

    /// Reads `key`; keys never written read as the default value.
    pub fn get(&self, key: Key) -> Result<V> {
        match self {
            Storage::Sparse(map) => Ok(map.get(&key).copied().unwrap_or_default()),
            Storage::Dense { range, values } => Ok(values[Self::offset(range, key)?]),
        }
    }

    /// Accumulates `delta` into the value stored at `key`.
    pub fn add(&mut self, key: Key, delta: V) -> Result<()> {
        match self {
            Storage::Sparse(map) => *map.entry(key).or_default() += delta,
            Storage::Dense { range, values } => values[Self::offset(range, key)?] += delta,
        }
        Ok(())
    }

    /// Applies a whole batch. Callers validate the batch first; a failing key
    /// leaves the earlier keys of the batch applied.
    pub fn add_batch(&mut self, keys: &[Key], deltas: &[V]) -> Result<()> {
        for (&key, &delta) in keys.iter().zip(deltas) {
            self.add(key, delta)?;
        }
        Ok(())
    }

    /// Reads every key of `keys`, in order.
    pub fn get_batch(&self, keys: &[Key]) -> Result<Vec<V>> {
        keys.iter().map(|&key| self.get(key)).collect()
    }

    /// Number of keys materialised in memory.
    pub fn len(&self) -> usize {
        match self {
            Storage::Sparse(map) => map.len(),
            Storage::Dense { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
