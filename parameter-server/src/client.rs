//! Worker-side handle to one table.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::error::{PsError, Result};
use crate::message::{ArrayBlock, Clock, Key, Message, Op, TableId, ThreadId, Value};
use crate::topology::RangeRouter;
use crate::transport::Transport;

/// A worker thread's view of a table.
///
/// Owned by exactly one thread. Keys passed to [`add`](Self::add) and
/// [`get`](Self::get) must be sorted ascending.
pub struct KvClientTable<V> {
    app_thread_id: ThreadId,
    table_id: TableId,
    router: Arc<RangeRouter>,
    transport: Arc<dyn Transport>,
    inbox: Receiver<Message>,
    clock: Clock,
    next_request_id: u64,
    /// Requests given up on, with the number of responses still in flight.
    abandoned: HashMap<u64, usize>,
    _values: PhantomData<V>,
}

/// Bookkeeping for one outstanding Get.
struct Correlator {
    request_id: u64,
    waiting: HashMap<ThreadId, Range<usize>>,
    answered: HashSet<ThreadId>,
}

impl<V: Value> KvClientTable<V> {
    /// Builds a handle for `app_thread_id`. Responses for it must be routed
    /// to `inbox`; [`Engine::table`](crate::engine::Engine::table) does the
    /// wiring.
    pub fn new(
        app_thread_id: ThreadId,
        table_id: TableId,
        router: Arc<RangeRouter>,
        transport: Arc<dyn Transport>,
        inbox: Receiver<Message>,
    ) -> Self {
        Self {
            app_thread_id,
            table_id,
            router,
            transport,
            inbox,
            clock: 0,
            next_request_id: 0,
            abandoned: HashMap::new(),
            _values: PhantomData,
        }
    }

    /// The worker this handle speaks for.
    pub fn app_thread_id(&self) -> ThreadId {
        self.app_thread_id
    }

    /// The table this handle reads and writes.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// The local clock, i.e. the number of completed iterations.
    pub fn current_clock(&self) -> Clock {
        self.clock
    }

    fn message(&self, op: Op, shard: ThreadId) -> Message {
        Message::new(op, self.app_thread_id, shard, self.table_id).with_clock(self.clock)
    }

    /// Sends one Add per touched shard. Does not wait for the shards.
    pub fn add(&mut self, keys: &[Key], values: &[V]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(PsError::malformed(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        for part in self.router.partition(keys)? {
            let msg = self
                .message(Op::Add, part.shard)
                .with_block(ArrayBlock::Keys(keys[part.span.clone()].to_vec()))
                .with_block(V::into_block(values[part.span].to_vec()));
            self.transport.send(msg)?;
        }
        Ok(())
    }

    /// Reads `keys`, blocking until every queried shard has answered.
    pub fn get(&mut self, keys: &[Key]) -> Result<Vec<V>> {
        self.fetch(keys, None)
    }

    /// Like [`get`](Self::get), but gives up after `timeout`.
    ///
    /// Responses that arrive after the deadline are discarded by later calls.
    pub fn get_with_timeout(&mut self, keys: &[Key], timeout: Duration) -> Result<Vec<V>> {
        self.fetch(keys, Some(Instant::now() + timeout))
    }

    /// Advances the local clock and tells every shard of the table.
    ///
    /// The local clock only moves once every shard has been sent the new
    /// value. When a send fails, the clock stays put and the call can be
    /// retried; shards that already received the new clock drop the repeat
    /// as a non-increasing clock.
    pub fn clock(&mut self) -> Result<()> {
        let next = self.clock + 1;
        for &shard in self.router.shard_ids() {
            self.transport
                .send(self.message(Op::Clock, shard).with_clock(next))?;
        }
        self.clock = next;
        Ok(())
    }

    fn fetch(&mut self, keys: &[Key], deadline: Option<Instant>) -> Result<Vec<V>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let parts = self.router.partition(keys)?;
        self.next_request_id += 1;
        let request_id = self.next_request_id;

        let mut correlator = Correlator {
            request_id,
            waiting: HashMap::with_capacity(parts.len()),
            answered: HashSet::new(),
        };
        for part in parts {
            let msg = self
                .message(Op::Get, part.shard)
                .with_request_id(request_id)
                .with_block(ArrayBlock::Keys(keys[part.span.clone()].to_vec()));
            if let Err(err) = self.transport.send(msg) {
                self.abandon(&correlator);
                return Err(err);
            }
            correlator.waiting.insert(part.shard, part.span);
        }

        let mut values = vec![V::default(); keys.len()];
        let result = self.collect(keys, &mut correlator, &mut values, deadline);
        if result.is_err() {
            self.abandon(&correlator);
        }
        result.map(|()| values)
    }

    fn collect(
        &mut self,
        keys: &[Key],
        correlator: &mut Correlator,
        values: &mut [V],
        deadline: Option<Instant>,
    ) -> Result<()> {
        while !correlator.waiting.is_empty() {
            let msg = self.next_response(correlator.request_id, deadline)?;
            if msg.request_id != correlator.request_id {
                self.discard_or_reject(&msg)?;
                continue;
            }
            let shard = msg.sender;
            let Some(span) = correlator.waiting.remove(&shard) else {
                let why = if correlator.answered.contains(&shard) {
                    "duplicate response"
                } else {
                    "response from a shard that was not queried"
                };
                return Err(PsError::protocol(format!(
                    "{why}: shard {shard}, request {}",
                    correlator.request_id
                )));
            };
            correlator.answered.insert(shard);

            let payload = msg
                .keys()
                .and_then(|k| Ok((k, msg.values::<V>()?)))
                .map_err(|err| PsError::protocol(format!("shard {shard}: {err}")))?;
            let (got_keys, got_values) = payload;
            if got_keys != &keys[span.clone()] || got_values.len() != span.len() {
                return Err(PsError::protocol(format!(
                    "shard {shard} answered {} keys / {} values for {} requested",
                    got_keys.len(),
                    got_values.len(),
                    span.len()
                )));
            }
            values[span].copy_from_slice(got_values);
        }
        Ok(())
    }

    fn next_response(&self, request_id: u64, deadline: Option<Instant>) -> Result<Message> {
        let closed = || PsError::Transport(format!("inbox of thread {} closed", self.app_thread_id));
        match deadline {
            None => self.inbox.recv().map_err(|_| closed()),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                match self.inbox.recv_timeout(left) {
                    Ok(msg) => Ok(msg),
                    Err(RecvTimeoutError::Timeout) => Err(PsError::Timeout { request_id }),
                    Err(RecvTimeoutError::Disconnected) => Err(closed()),
                }
            }
        }
    }

    /// Drops a late response to an abandoned request; anything else that
    /// does not match the current request is a protocol violation.
    fn discard_or_reject(&mut self, msg: &Message) -> Result<()> {
        let Some(outstanding) = self.abandoned.get_mut(&msg.request_id) else {
            return Err(PsError::protocol(format!(
                "response from shard {} to unknown request {}",
                msg.sender, msg.request_id
            )));
        };
        debug!(
            app_thread_id = self.app_thread_id,
            table_id = self.table_id,
            request_id = msg.request_id,
            shard = msg.sender,
            "discarding late response"
        );
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.abandoned.remove(&msg.request_id);
        }
        Ok(())
    }

    fn abandon(&mut self, correlator: &Correlator) {
        if !correlator.waiting.is_empty() {
            self.abandoned
                .insert(correlator.request_id, correlator.waiting.len());
        }
    }
}

impl<V> Drop for KvClientTable<V> {
    fn drop(&mut self) {
        self.transport.close_inbox(self.app_thread_id, self.table_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use crossbeam_channel::{unbounded, Sender};

    use super::*;
    use crate::topology::KeyRange;

    const APP: ThreadId = 15;
    const TABLE: TableId = 23;

    /// Records every sent message instead of delivering it.
    struct RecordingTransport {
        sent: Sender<Message>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, msg: Message) -> Result<()> {
            self.sent
                .send(msg)
                .map_err(|_| PsError::Transport("recorder gone".into()))
        }
    }

    struct Fixture {
        client: KvClientTable<f32>,
        sent: Receiver<Message>,
        responses: Sender<Message>,
    }

    fn fixture() -> Fixture {
        let router =
            RangeRouter::new(vec![KeyRange::new(2, 4), KeyRange::new(4, 7)], vec![0, 1]).unwrap();
        let (sent_tx, sent) = unbounded();
        let (responses, inbox) = unbounded();
        let client = KvClientTable::new(
            APP,
            TABLE,
            Arc::new(router),
            Arc::new(RecordingTransport { sent: sent_tx }),
            inbox,
        );
        Fixture {
            client,
            sent,
            responses,
        }
    }

    fn response(shard: ThreadId, request_id: u64, keys: &[Key], vals: &[f32]) -> Message {
        Message::new(Op::Response, shard, APP, TABLE)
            .with_request_id(request_id)
            .with_block(ArrayBlock::Keys(keys.to_vec()))
            .with_block(ArrayBlock::F32(vals.to_vec()))
    }

    #[test]
    fn test_add_splits_by_shard_in_relative_order() {
        let mut f = fixture();
        f.client.add(&[3, 4, 5, 6], &[0.1; 4]).unwrap();

        let to_0 = f.sent.try_recv().unwrap();
        assert_eq!((to_0.op, to_0.receiver), (Op::Add, 0));
        assert_eq!(to_0.keys().unwrap(), &[3]);
        assert_eq!(to_0.values::<f32>().unwrap(), &[0.1f32]);

        let to_1 = f.sent.try_recv().unwrap();
        assert_eq!(to_1.receiver, 1);
        assert_eq!(to_1.keys().unwrap(), &[4, 5, 6]);
        assert_eq!(to_1.values::<f32>().unwrap(), &[0.1f32; 3]);
        assert!(f.sent.try_recv().is_err());
    }

    #[test]
    fn test_add_touching_one_shard_sends_one_message() {
        let mut f = fixture();
        f.client.add(&[5, 6], &[1.0, 2.0]).unwrap();
        assert_eq!(f.sent.try_iter().count(), 1);
    }

    #[test]
    fn test_get_reassembles_out_of_order_responses() {
        let mut f = fixture();
        let sent = f.sent.clone();
        let responses = f.responses.clone();
        let shards = thread::spawn(move || {
            let to_0 = sent.recv().unwrap();
            let to_1 = sent.recv().unwrap();
            // Shard 1 answers first.
            responses
                .send(response(1, to_1.request_id, &[4, 5, 6], &[0.4, 0.2, 0.3]))
                .unwrap();
            responses.send(response(0, to_0.request_id, &[3], &[0.1])).unwrap();
        });

        let values = f.client.get(&[3, 4, 5, 6]).unwrap();
        assert_eq!(values, vec![0.1, 0.4, 0.2, 0.3]);
        shards.join().unwrap();
    }

    #[test]
    fn test_clock_reaches_every_shard() {
        let mut f = fixture();
        f.client.clock().unwrap();
        f.client.clock().unwrap();
        let clocks: Vec<_> = f.sent.try_iter().map(|m| (m.op, m.receiver, m.clock)).collect();
        assert_eq!(
            clocks,
            vec![
                (Op::Clock, 0, 1),
                (Op::Clock, 1, 1),
                (Op::Clock, 0, 2),
                (Op::Clock, 1, 2)
            ]
        );
        assert_eq!(f.client.current_clock(), 2);
    }

    /// Fails every send to shard 1 while `cut` is set.
    struct CutTransport {
        sent: Sender<Message>,
        cut: Arc<AtomicBool>,
    }

    impl Transport for CutTransport {
        fn send(&self, msg: Message) -> Result<()> {
            if msg.receiver == 1 && self.cut.load(Ordering::SeqCst) {
                return Err(PsError::Transport("shard 1 unreachable".into()));
            }
            self.sent
                .send(msg)
                .map_err(|_| PsError::Transport("recorder gone".into()))
        }
    }

    #[test]
    fn test_failed_clock_keeps_local_clock_and_can_be_retried() {
        let router =
            RangeRouter::new(vec![KeyRange::new(2, 4), KeyRange::new(4, 7)], vec![0, 1]).unwrap();
        let (sent_tx, sent) = unbounded();
        let (_responses, inbox) = unbounded();
        let cut = Arc::new(AtomicBool::new(true));
        let transport = CutTransport {
            sent: sent_tx,
            cut: cut.clone(),
        };
        let mut client: KvClientTable<f32> =
            KvClientTable::new(APP, TABLE, Arc::new(router), Arc::new(transport), inbox);

        assert!(matches!(client.clock(), Err(PsError::Transport(_))));
        assert_eq!(client.current_clock(), 0);
        let partial: Vec<_> = sent.try_iter().map(|m| (m.receiver, m.clock)).collect();
        assert_eq!(partial, vec![(0, 1)]);

        cut.store(false, Ordering::SeqCst);
        client.clock().unwrap();
        assert_eq!(client.current_clock(), 1);
        let retried: Vec<_> = sent.try_iter().map(|m| (m.receiver, m.clock)).collect();
        assert_eq!(retried, vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn test_messages_carry_local_clock() {
        let mut f = fixture();
        f.client.clock().unwrap();
        let _ = f.sent.try_iter().count();
        f.client.add(&[2], &[1.0]).unwrap();
        assert_eq!(f.sent.try_recv().unwrap().clock, 1);
    }

    #[test]
    fn test_unroutable_key_sends_nothing() {
        let mut f = fixture();
        assert!(matches!(
            f.client.add(&[3, 9], &[1.0, 1.0]),
            Err(PsError::KeyOutOfRange { key: 9 })
        ));
        assert!(matches!(f.client.get(&[1]), Err(PsError::KeyOutOfRange { key: 1 })));
        assert!(f.sent.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_response_is_a_protocol_violation() {
        let mut f = fixture();
        f.responses.send(response(0, 1, &[3], &[0.1])).unwrap();
        f.responses.send(response(0, 1, &[3], &[0.1])).unwrap();
        let err = f.client.get(&[3, 4]).unwrap_err();
        assert!(matches!(err, PsError::ProtocolViolation(_)), "{err}");
    }

    #[test]
    fn test_unqueried_shard_and_unknown_request_are_rejected() {
        let mut f = fixture();
        f.responses.send(response(1, 1, &[4], &[0.1])).unwrap();
        assert!(matches!(f.client.get(&[3]), Err(PsError::ProtocolViolation(_))));

        let mut f = fixture();
        f.responses.send(response(0, 99, &[3], &[0.1])).unwrap();
        assert!(matches!(f.client.get(&[3]), Err(PsError::ProtocolViolation(_))));
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let mut f = fixture();
        f.responses.send(response(0, 1, &[2], &[0.1])).unwrap();
        assert!(matches!(f.client.get(&[3]), Err(PsError::ProtocolViolation(_))));

        let mut f = fixture();
        let short = Message::new(Op::Response, 0, APP, TABLE)
            .with_request_id(1)
            .with_block(ArrayBlock::Keys(vec![3]));
        f.responses.send(short).unwrap();
        assert!(matches!(f.client.get(&[3]), Err(PsError::ProtocolViolation(_))));
    }

    #[test]
    fn test_timeout_then_late_response_is_discarded() {
        let mut f = fixture();
        let err = f
            .client
            .get_with_timeout(&[3], Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, PsError::Timeout { request_id: 1 }));

        // The late answer to request 1 arrives ahead of the answer to 2.
        f.responses.send(response(0, 1, &[3], &[9.0])).unwrap();
        f.responses.send(response(0, 2, &[3], &[0.5])).unwrap();
        assert_eq!(f.client.get(&[3]).unwrap(), vec![0.5]);
        assert!(f.client.abandoned.is_empty());
    }

    #[test]
    fn test_empty_get_sends_nothing() {
        let mut f = fixture();
        assert!(f.client.get(&[]).unwrap().is_empty());
        assert!(f.sent.try_recv().is_err());
    }
}
