//! Message delivery between worker threads and shard threads.
//!
//! The engine only needs a way to hand a [`Message`] to whoever it is
//! addressed to. [`Mailbox`] does that in-process with one crossbeam channel
//! per shard and one per (worker, table) inbox, so a sender's messages reach
//! a shard in the order they were sent.

use std::collections::HashMap;
use std::sync::RwLock;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use crate::error::{PsError, Result};
use crate::message::{Message, Op, TableId, ThreadId};

/// Send primitive the engine is built on.
pub trait Transport: Send + Sync {
    fn send(&self, msg: Message) -> Result<()>;

    /// Called when a client table is dropped and its inbox is no longer read.
    fn close_inbox(&self, _thread: ThreadId, _table_id: TableId) {}
}

/// In-process transport backed by crossbeam channels.
///
/// Responses are delivered to the inbox registered for
/// `(receiver, table_id)`; every other op goes to the receiving shard's
/// queue.
#[derive(Default)]
pub struct Mailbox {
    shards: RwLock<HashMap<ThreadId, Sender<Message>>>,
    inboxes: RwLock<HashMap<(ThreadId, TableId), Sender<Message>>>,
    /// Push every message through the wire codec before delivery.
    encoded: bool,
}

impl Mailbox {
    /// A mailbox that hands messages over as values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailbox that serializes and deserializes each message, the way a
    /// byte transport would.
    pub fn encoded() -> Self {
        Self {
            encoded: true,
            ..Self::default()
        }
    }

    /// Creates the queue for `shard` and returns its receiving end.
    pub fn register_shard(&self, shard: ThreadId) -> Result<Receiver<Message>> {
        let (tx, rx) = unbounded();
        let mut shards = self
            .shards
            .write()
            .map_err(|_| PsError::Transport("shard registry poisoned".into()))?;
        if shards.contains_key(&shard) {
            return Err(PsError::Transport(format!("shard {shard} registered twice")));
        }
        shards.insert(shard, tx);
        Ok(rx)
    }

    /// Stops routing to `shard`; later sends to it fail.
    pub fn deregister_shard(&self, shard: ThreadId) {
        if let Ok(mut shards) = self.shards.write() {
            shards.remove(&shard);
        }
    }

    /// Creates the response inbox for `thread` on `table_id`.
    pub fn register_inbox(&self, thread: ThreadId, table_id: TableId) -> Result<Receiver<Message>> {
        let (tx, rx) = unbounded();
        let mut inboxes = self
            .inboxes
            .write()
            .map_err(|_| PsError::Transport("inbox registry poisoned".into()))?;
        if inboxes.contains_key(&(thread, table_id)) {
            return Err(PsError::Transport(format!(
                "thread {thread} already has an inbox for table {table_id}"
            )));
        }
        inboxes.insert((thread, table_id), tx);
        Ok(rx)
    }

    /// Stops routing responses for `thread` on `table_id`.
    pub fn deregister_inbox(&self, thread: ThreadId, table_id: TableId) {
        if let Ok(mut inboxes) = self.inboxes.write() {
            inboxes.remove(&(thread, table_id));
        }
    }

    fn route(&self, msg: &Message) -> Result<Sender<Message>> {
        let found = if msg.op == Op::Response {
            self.inboxes
                .read()
                .map_err(|_| PsError::Transport("inbox registry poisoned".into()))?
                .get(&(msg.receiver, msg.table_id))
                .cloned()
        } else {
            self.shards
                .read()
                .map_err(|_| PsError::Transport("shard registry poisoned".into()))?
                .get(&msg.receiver)
                .cloned()
        };
        found.ok_or_else(|| {
            PsError::Transport(format!(
                "no route to thread {} for {:?} on table {}",
                msg.receiver, msg.op, msg.table_id
            ))
        })
    }
}

impl Transport for Mailbox {
    fn send(&self, msg: Message) -> Result<()> {
        let tx = self.route(&msg)?;
        let msg = if self.encoded {
            Message::decode(&msg.encode()?)?
        } else {
            msg
        };
        trace!(
            sender = msg.sender,
            receiver = msg.receiver,
            op = ?msg.op,
            table_id = msg.table_id,
            "deliver"
        );
        let receiver = msg.receiver;
        tx.send(msg)
            .map_err(|_| PsError::Transport(format!("thread {receiver} hung up")))
    }

    fn close_inbox(&self, thread: ThreadId, table_id: TableId) {
        self.deregister_inbox(thread, table_id);
    }
}
