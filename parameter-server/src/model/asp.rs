use crate::error::Result;
use crate::message::{Message, Value};

use super::ShardState;

/// Asynchronous parallel: updates land immediately, reads never wait.
pub struct AspModel<V> {
    pub(super) state: ShardState<V>,
}

impl<V: Value> AspModel<V> {
    pub fn new(state: ShardState<V>) -> Self {
        Self { state }
    }

    /// Applies the Add at once.
    pub fn on_add(&mut self, msg: Message) -> Result<()> {
        self.state.validate_add(&msg)?;
        self.state.apply_add(&msg)
    }

    pub fn on_get(&mut self, msg: Message) -> Result<Option<Message>> {
        self.state.validate_get(&msg)?;
        self.state.answer_get(&msg).map(Some)
    }

    /// Records the clock. Nothing is ever waiting.
    pub fn on_clock(&mut self, msg: Message) -> Result<Vec<Message>> {
        self.state.progress.advance(msg.sender, msg.clock)?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TableConfig;
    use crate::model::testing::*;
    use crate::store::StorageKind;

    #[test]
    fn test_get_after_add_sums_exactly() {
        let mut m = model(TableConfig::asp(StorageKind::Sparse), &[1]);
        m.on_add(add(1, 0, &[1, 2], &[0.5, 1.0])).unwrap();
        m.on_add(add(1, 0, &[2, 3], &[1.0, 2.0])).unwrap();
        let resp = m.on_get(get(1, 0, &[1, 2, 3, 4])).unwrap().unwrap();
        assert_eq!(values(&resp), vec![0.5, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_reads_never_wait_for_peers() {
        let mut m = model(TableConfig::asp(StorageKind::Dense), &[1, 2]);
        for c in 1..=10 {
            m.on_clock(clock(1, c)).unwrap();
        }
        m.on_add(add(2, 0, &[9], &[4.0])).unwrap();
        let resp = m.on_get(get(1, 10, &[9])).unwrap().expect("asp answers at once");
        assert_eq!(values(&resp), vec![4.0]);
        assert_eq!(m.state().min_clock(), 0);
    }
}
