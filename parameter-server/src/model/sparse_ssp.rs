use tracing::debug;

use crate::error::Result;
use crate::message::{Clock, Message, Value};

use super::recorder::Recorder;
use super::ShardState;

/// SSP that lets a read run past the staleness bound when the keys it
/// touches have seen few concurrent writes.
///
/// Every Add is recorded per key as `(sender, clock)`. A Get that fails the
/// staleness test is still answered when each of its keys has fewer than
/// `speculation` writes from other senders that the minimum clock has not
/// covered yet. With `speculation == 0` this is plain SSP.
pub struct SparseSspModel<V> {
    pub(super) state: ShardState<V>,
    staleness: Clock,
    speculation: usize,
    recorder: Recorder,
}

/// True when every key of `msg` is sparse enough to read early.
fn speculative(recorder: &Recorder, speculation: usize, msg: &Message) -> bool {
    speculation > 0
        && msg.keys().is_ok_and(|keys| {
            keys.iter()
                .all(|&k| recorder.unsynchronized_writes(k, msg.sender) < speculation)
        })
}

impl<V: Value> SparseSspModel<V> {
    /// Wraps `state`; `speculation` is the per-key write threshold below
    /// which a read may run ahead.
    pub fn new(
        state: ShardState<V>,
        staleness: Clock,
        speculation: usize,
        recorder: Recorder,
    ) -> Self {
        Self {
            state,
            staleness,
            speculation,
            recorder,
        }
    }

    /// Applies the Add and stamps each of its keys.
    pub fn on_add(&mut self, msg: Message) -> Result<()> {
        self.state.validate_add(&msg)?;
        self.state.apply_add(&msg)?;
        for &key in msg.keys()? {
            self.recorder.record(key, msg.sender, msg.clock)?;
        }
        Ok(())
    }

    pub fn on_get(&mut self, msg: Message) -> Result<Option<Message>> {
        self.state.validate_get(&msg)?;
        let eligible_at = msg.clock.saturating_sub(self.staleness);
        if self.state.min_clock() >= eligible_at {
            return self.state.answer_get(&msg).map(Some);
        }
        if speculative(&self.recorder, self.speculation, &msg) {
            debug!(
                table_id = self.state.table_id,
                sender = msg.sender,
                clock = msg.clock,
                "answering get speculatively"
            );
            return self.state.answer_get(&msg).map(Some);
        }
        self.state.pending.push(eligible_at, msg);
        Ok(None)
    }

    /// Forgets synchronized writes, then releases Gets that reached their
    /// bound or became quiet enough to read early.
    pub fn on_clock(&mut self, msg: Message) -> Result<Vec<Message>> {
        let Some(min_clock) = self.state.progress.advance(msg.sender, msg.clock)? else {
            return Ok(Vec::new());
        };
        self.recorder.synchronize(min_clock);

        let mut released = self.state.pending.pop_through(min_clock);
        // Synchronizing may have thinned out keys some later Gets wait on.
        let (recorder, speculation) = (&self.recorder, self.speculation);
        released.extend(
            self.state
                .pending
                .take_where(|m| speculative(recorder, speculation, m)),
        );
        Ok(self.state.answer_all(released))
    }

    /// Keys with writes the slowest worker has not clocked past.
    pub fn tracked_keys(&self) -> usize {
        self.recorder.tracked_keys()
    }
}
