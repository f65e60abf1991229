//! Per-sender clock bookkeeping for one table on one shard.

use std::collections::BTreeMap;

use crate::error::{PsError, Result};
use crate::message::{Clock, ThreadId};

/// Tracks every worker's clock and the minimum across them.
///
/// Membership is either pinned by [`ProgressTracker::reset`] or grows as
/// senders are first seen. Pinned trackers reject unknown senders.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    clocks: BTreeMap<ThreadId, Clock>,
    pinned: bool,
    min_clock: Clock,
}

impl ProgressTracker {
    /// Empty tracker with open membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the worker set; every worker restarts at clock 0.
    pub fn reset(&mut self, workers: &[ThreadId]) {
        self.clocks = workers.iter().map(|&w| (w, 0)).collect();
        self.pinned = true;
        self.min_clock = 0;
    }

    /// Fails when membership is pinned and `sender` is not part of it.
    /// Never changes the tracker.
    pub fn check_member(&self, sender: ThreadId) -> Result<()> {
        if self.pinned && !self.clocks.contains_key(&sender) {
            return Err(PsError::malformed(format!(
                "sender {sender} is not a registered worker"
            )));
        }
        Ok(())
    }

    /// Ensures `sender` is tracked, admitting it at clock 0 when membership
    /// is not pinned.
    ///
    /// Only call this for a message that has been accepted.
    pub fn admit(&mut self, sender: ThreadId) -> Result<()> {
        if self.clocks.contains_key(&sender) {
            return Ok(());
        }
        self.check_member(sender)?;
        self.clocks.insert(sender, 0);
        self.min_clock = 0;
        Ok(())
    }

    /// Moves `sender` to `clock`, admitting an unseen sender directly at
    /// `clock` when membership is open.
    ///
    /// Returns `Some(new_min)` when the minimum clock advanced. A rejected
    /// clock leaves the tracker untouched.
    pub fn advance(&mut self, sender: ThreadId, clock: Clock) -> Result<Option<Clock>> {
        let current = match self.clocks.get(&sender) {
            Some(&current) => current,
            None => {
                self.check_member(sender)?;
                0
            }
        };
        if clock <= current {
            return Err(PsError::malformed(format!(
                "clock from {sender} went from {current} to {clock}"
            )));
        }
        self.clocks.insert(sender, clock);
        let prev_min = self.min_clock;
        self.min_clock = self.clocks.values().copied().min().unwrap_or(0);
        Ok((self.min_clock > prev_min).then_some(self.min_clock))
    }

    /// Smallest clock across the tracked workers; 0 when there are none.
    pub fn min_clock(&self) -> Clock {
        self.min_clock
    }

    /// Clock of `sender`, or `None` when it is not tracked.
    pub fn progress(&self, sender: ThreadId) -> Option<Clock> {
        self.clocks.get(&sender).copied()
    }

    /// Number of tracked workers.
    pub fn num_workers(&self) -> usize {
        self.clocks.len()
    }
}
