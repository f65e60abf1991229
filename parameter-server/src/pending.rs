//! Clock-indexed buffer of messages a shard cannot act on yet.

use std::collections::BTreeMap;

use crate::message::{Clock, Message};

/// Messages parked per clock until the minimum clock reaches it.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    buffer: BTreeMap<Clock, Vec<Message>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg` to the messages waiting for `clock`.
    pub fn push(&mut self, clock: Clock, msg: Message) {
        self.buffer.entry(clock).or_default().push(msg);
    }

    /// Removes and returns every message buffered at `clock`, in push order.
    pub fn pop(&mut self, clock: Clock) -> Vec<Message> {
        self.buffer.remove(&clock).unwrap_or_default()
    }

    /// Removes every message buffered at or below `clock`, lowest clock
    /// first, push order within a clock.
    pub fn pop_through(&mut self, clock: Clock) -> Vec<Message> {
        let rest = match clock.checked_add(1) {
            Some(next) => self.buffer.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = std::mem::replace(&mut self.buffer, rest);
        released.into_values().flatten().collect()
    }

    /// Removes the messages matching `pred`, keeping clock order.
    pub fn take_where(&mut self, mut pred: impl FnMut(&Message) -> bool) -> Vec<Message> {
        let mut taken = Vec::new();
        for msgs in self.buffer.values_mut() {
            let mut kept = Vec::with_capacity(msgs.len());
            for msg in msgs.drain(..) {
                if pred(&msg) {
                    taken.push(msg);
                } else {
                    kept.push(msg);
                }
            }
            *msgs = kept;
        }
        self.buffer.retain(|_, msgs| !msgs.is_empty());
        taken
    }

    /// Number of messages buffered at `clock`.
    pub fn size(&self, clock: Clock) -> usize {
        self.buffer.get(&clock).map_or(0, Vec::len)
    }

    /// Total number of buffered messages.
    pub fn len(&self) -> usize {
        self.buffer.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Op;

    fn msg(sender: u32) -> Message {
        Message::new(Op::Get, sender, 0, 0)
    }

    #[test]
    fn test_pop_returns_push_order_once() {
        let mut buf = PendingBuffer::new();
        buf.push(3, msg(1));
        buf.push(3, msg(2));
        assert_eq!(buf.size(3), 2);

        let popped = buf.pop(3);
        assert_eq!(popped, vec![msg(1), msg(2)]);
        assert!(buf.pop(3).is_empty());
        assert_eq!(buf.size(3), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_leaves_other_clocks() {
        let mut buf = PendingBuffer::new();
        buf.push(1, msg(1));
        buf.push(2, msg(2));
        assert_eq!(buf.pop(1), vec![msg(1)]);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.size(2), 1);
    }

    #[test]
    fn test_pop_through_releases_lower_clocks_in_order() {
        let mut buf = PendingBuffer::new();
        buf.push(5, msg(5));
        buf.push(2, msg(2));
        buf.push(3, msg(3));
        buf.push(2, msg(22));

        assert_eq!(buf.pop_through(3), vec![msg(2), msg(22), msg(3)]);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.pop_through(Clock::MAX), vec![msg(5)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_where_keeps_the_rest() {
        let mut buf = PendingBuffer::new();
        buf.push(1, msg(1));
        buf.push(1, msg(2));
        buf.push(4, msg(3));

        let taken = buf.take_where(|m| m.sender != 2);
        assert_eq!(taken, vec![msg(1), msg(3)]);
        assert_eq!(buf.pop(1), vec![msg(2)]);
        assert!(buf.is_empty());
    }
}
