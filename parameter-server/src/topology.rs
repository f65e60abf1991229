//! Range-based routing of keys to shards.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{PsError, Result};
use crate::message::{Key, ThreadId};

/// Half-open key interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    /// The half-open range `[begin, end)`.
    pub fn new(begin: Key, end: Key) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.begin <= key && key < self.end
    }

    /// Number of keys in the range.
    pub fn width(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl From<Range<Key>> for KeyRange {
    fn from(r: Range<Key>) -> Self {
        Self::new(r.start, r.end)
    }
}

/// A run of consecutive positions in a key batch owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub shard: ThreadId,
    pub span: Range<usize>,
}

/// Maps keys of one table to the shard owning them.
///
/// Immutable after construction, so a single instance is shared between all
/// worker threads through an `Arc`.
#[derive(Debug, Clone)]
pub struct RangeRouter {
    ranges: Vec<KeyRange>,
    shards: Vec<ThreadId>,
}

impl RangeRouter {
    /// Builds a router from sorted ranges and the shard bound to each one.
    pub fn new(ranges: Vec<KeyRange>, shards: Vec<ThreadId>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(PsError::config("a table needs at least one range"));
        }
        if ranges.len() != shards.len() {
            return Err(PsError::config(format!(
                "{} ranges but {} shards",
                ranges.len(),
                shards.len()
            )));
        }
        if let Some((i, s)) = shards
            .iter()
            .enumerate()
            .find(|&(i, s)| shards[..i].contains(s))
        {
            return Err(PsError::config(format!(
                "shard {s} owns more than one range (index {i})"
            )));
        }
        if let Some(r) = ranges.iter().find(|r| r.is_empty()) {
            return Err(PsError::config(format!("range {r} is empty")));
        }
        for pair in ranges.windows(2) {
            if pair[0].end > pair[1].begin {
                return Err(PsError::config(format!(
                    "ranges {} and {} are unsorted or overlap",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self { ranges, shards })
    }

    /// Splits `[0, num_keys)` into `shards.len()` contiguous ranges of near
    /// equal width.
    pub fn even(num_keys: u64, shards: Vec<ThreadId>) -> Result<Self> {
        let n = shards.len() as u64;
        if n == 0 || num_keys < n {
            return Err(PsError::config(format!(
                "cannot split {num_keys} keys across {n} shards"
            )));
        }
        let ranges = (0..n)
            .map(|i| KeyRange::new(num_keys * i / n, num_keys * (i + 1) / n))
            .collect();
        Self::new(ranges, shards)
    }

    /// Ranges in shard order.
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Every shard owning a range, in range order.
    pub fn shard_ids(&self) -> &[ThreadId] {
        &self.shards
    }

    /// The range bound to `shard`, if the shard hosts this table.
    pub fn range_of(&self, shard: ThreadId) -> Option<KeyRange> {
        self.shards
            .iter()
            .position(|&s| s == shard)
            .map(|i| self.ranges[i])
    }

    fn range_index(&self, key: Key) -> Result<usize> {
        // First range whose end lies beyond the key.
        let idx = self.ranges.partition_point(|r| r.end <= key);
        match self.ranges.get(idx) {
            Some(r) if r.contains(key) => Ok(idx),
            _ => Err(PsError::KeyOutOfRange { key }),
        }
    }

    /// Owning shard of a key, by binary search over the ranges.
    pub fn shard_for(&self, key: Key) -> Result<ThreadId> {
        self.range_index(key).map(|i| self.shards[i])
    }

    /// Splits a sorted key batch into per-shard runs.
    ///
    /// Runs come out in key order; concatenating their spans yields
    /// `0..keys.len()`.
    pub fn partition(&self, keys: &[Key]) -> Result<Vec<Partition>> {
        debug_assert!(
            keys.windows(2).all(|w| w[0] <= w[1]),
            "keys must be sorted ascending"
        );
        let mut parts: Vec<Partition> = Vec::new();
        let mut start = 0;
        while start < keys.len() {
            let idx = self.range_index(keys[start])?;
            let end_key = self.ranges[idx].end;
            let len = keys[start..].partition_point(|&k| k < end_key);
            parts.push(Partition {
                shard: self.shards[idx],
                span: start..start + len,
            });
            start += len;
        }
        Ok(parts)
    }
}
