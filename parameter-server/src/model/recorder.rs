//! Per-key write history used by sparse SSP to decide when a read may run
//! ahead of the staleness bound.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PsError, Result};
use crate::message::{Clock, Key, ThreadId};
use crate::store::dense_slots;
use crate::topology::KeyRange;

/// Layout of the write recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RecorderKind {
    /// Only keys that were written take space.
    Sparse,
    /// One slot per key of the shard's range.
    Dense,
}

/// One write: who issued it and at which clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStamp {
    pub sender: ThreadId,
    pub clock: Clock,
}

/// Write history per key, kept until the slowest worker clocks past it.
pub enum Recorder {
    Sparse(HashMap<Key, Vec<WriteStamp>>),
    Dense {
        range: KeyRange,
        slots: Vec<Vec<WriteStamp>>,
    },
}

impl Recorder {
    /// Builds an empty recorder; the dense layout reserves a slot per key of
    /// `range` and fails like dense storage does when the range is too wide.
    pub fn new(kind: RecorderKind, range: KeyRange) -> Result<Self> {
        Ok(match kind {
            RecorderKind::Sparse => Recorder::Sparse(HashMap::new()),
            RecorderKind::Dense => Recorder::Dense {
                range,
                slots: dense_slots(range, Vec::new())?,
            },
        })
    }

    fn history(&self, key: Key) -> Option<&[WriteStamp]> {
        match self {
            Recorder::Sparse(map) => map.get(&key).map(Vec::as_slice),
            Recorder::Dense { range, slots } if range.contains(key) => {
                slots.get((key - range.begin) as usize).map(Vec::as_slice)
            }
            Recorder::Dense { .. } => None,
        }
    }

    /// Notes that `sender` wrote `key` while at `clock`.
    pub fn record(&mut self, key: Key, sender: ThreadId, clock: Clock) -> Result<()> {
        let history = match self {
            Recorder::Sparse(map) => map.entry(key).or_default(),
            Recorder::Dense { range, slots } => {
                if !range.contains(key) {
                    return Err(PsError::KeyOutOfRange { key });
                }
                &mut slots[(key - range.begin) as usize]
            }
        };
        let stamp = WriteStamp { sender, clock };
        // Repeated writes in one iteration count once.
        if !history.contains(&stamp) {
            history.push(stamp);
        }
        Ok(())
    }

    /// Number of writes to `key` by senders other than `requester` that the
    /// slowest worker has not yet clocked past.
    pub fn unsynchronized_writes(&self, key: Key, requester: ThreadId) -> usize {
        self.history(key)
            .map_or(0, |h| h.iter().filter(|s| s.sender != requester).count())
    }

    /// Forgets every write stamped below `min_clock`.
    pub fn synchronize(&mut self, min_clock: Clock) {
        match self {
            Recorder::Sparse(map) => map.retain(|_, history| {
                history.retain(|s| s.clock >= min_clock);
                !history.is_empty()
            }),
            Recorder::Dense { slots, .. } => {
                for history in slots.iter_mut() {
                    history.retain(|s| s.clock >= min_clock);
                }
            }
        }
    }

    /// Number of keys with at least one unsynchronized write.
    pub fn tracked_keys(&self) -> usize {
        match self {
            Recorder::Sparse(map) => map.len(),
            Recorder::Dense { slots, .. } => slots.iter().filter(|h| !h.is_empty()).count(),
        }
    }
}
