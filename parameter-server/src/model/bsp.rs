use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{Clock, Message, Op, Value};

use super::ShardState;

/// Bulk synchronous parallel.
///
/// A Get from a worker at clock `c` is answered once every worker has
/// reached `c`. Adds tagged above the current minimum wait in the pending
/// buffer under their tag, so an answered Get never sees an update from an
/// iteration beyond the barrier.
pub struct BspModel<V> {
    pub(super) state: ShardState<V>,
}

impl<V: Value> BspModel<V> {
    pub fn new(state: ShardState<V>) -> Self {
        Self { state }
    }

    /// Applies an Add from the current iteration, buffers one tagged
    /// beyond the barrier.
    pub fn on_add(&mut self, msg: Message) -> Result<()> {
        self.state.validate_add(&msg)?;
        if msg.clock <= self.state.min_clock() {
            self.state.apply_add(&msg)
        } else {
            self.state.pending.push(msg.clock, msg);
            Ok(())
        }
    }

    /// Answers once every worker has reached the reader's clock.
    pub fn on_get(&mut self, msg: Message) -> Result<Option<Message>> {
        self.state.validate_get(&msg)?;
        if msg.clock <= self.state.min_clock() {
            return self.state.answer_get(&msg).map(Some);
        }
        debug!(
            table_id = self.state.table_id,
            sender = msg.sender,
            clock = msg.clock,
            min_clock = self.state.min_clock(),
            "get waits for barrier"
        );
        self.state.pending.push(msg.clock, msg);
        Ok(None)
    }

    /// Advances the sender; a higher minimum releases buffered Adds
    /// first, then the Gets.
    pub fn on_clock(&mut self, msg: Message) -> Result<Vec<Message>> {
        match self.state.progress.advance(msg.sender, msg.clock)? {
            Some(min_clock) => Ok(self.release(min_clock)),
            None => Ok(Vec::new()),
        }
    }

    /// Applies every buffered Add up to `min_clock`, then answers the Gets.
    fn release(&mut self, min_clock: Clock) -> Vec<Message> {
        let (adds, gets): (Vec<_>, Vec<_>) = self
            .state
            .pending
            .pop_through(min_clock)
            .into_iter()
            .partition(|m| m.op == Op::Add);
        for add in &adds {
            if let Err(err) = self.state.apply_add(add) {
                warn!(table_id = self.state.table_id, sender = add.sender, error = %err, "dropping buffered add");
            }
        }
        self.state.answer_all(gets)
    }
}
