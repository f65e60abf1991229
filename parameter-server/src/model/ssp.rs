use tracing::debug;

use crate::error::Result;
use crate::message::{Clock, Message, Value};

use super::ShardState;

/// Stale synchronous parallel with staleness bound `S`.
///
/// A worker at clock `c` may read as long as the slowest worker has reached
/// `c - S`. Otherwise its Get is parked under `c - S` and answered by the
/// Clock that lifts the minimum to that value.
pub struct SspModel<V> {
    pub(super) state: ShardState<V>,
    staleness: Clock,
}

impl<V: Value> SspModel<V> {
    /// Wraps `state` with staleness bound `staleness`.
    pub fn new(state: ShardState<V>, staleness: Clock) -> Self {
        Self { state, staleness }
    }

    pub fn on_add(&mut self, msg: Message) -> Result<()> {
        self.state.validate_add(&msg)?;
        self.state.apply_add(&msg)
    }

    /// Answers when the slowest worker is within `staleness` of the
    /// reader, otherwise parks the Get.
    pub fn on_get(&mut self, msg: Message) -> Result<Option<Message>> {
        self.state.validate_get(&msg)?;
        let eligible_at = msg.clock.saturating_sub(self.staleness);
        if self.state.min_clock() >= eligible_at {
            return self.state.answer_get(&msg).map(Some);
        }
        debug!(
            table_id = self.state.table_id,
            sender = msg.sender,
            clock = msg.clock,
            eligible_at,
            "get exceeds staleness bound"
        );
        self.state.pending.push(eligible_at, msg);
        Ok(None)
    }

    /// Releases every Get whose bound the new minimum reached, however
    /// far it jumped.
    pub fn on_clock(&mut self, msg: Message) -> Result<Vec<Message>> {
        let Some(min_clock) = self.state.progress.advance(msg.sender, msg.clock)? else {
            return Ok(Vec::new());
        };
        let released = self.state.pending.pop_through(min_clock);
        Ok(self.state.answer_all(released))
    }
}
