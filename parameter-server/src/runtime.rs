//! Shard threads.
//!
//! Each shard runs one thread that owns every table hosted on it. The thread
//! waits on two channels with `crossbeam_channel::select!`:
//!
//! - the shard's message queue, fed by the [`Transport`];
//! - a control channel the engine uses to register tables, take status
//!   snapshots and shut the shard down.
//!
//! Messages are handled strictly one at a time, so models and storage need
//! no locking. A message a table rejects is logged and dropped; the shard
//! keeps serving.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{PsError, Result};
use crate::message::{Message, TableId, ThreadId};
use crate::model::{ShardTable, TableStatus};
use crate::transport::Transport;

/// Requests the engine sends to a shard thread.
enum ShardRequest {
    RegisterTable {
        table_id: TableId,
        table: Box<dyn ShardTable>,
        respond_to: Sender<Result<()>>,
    },
    Status {
        respond_to: Sender<Vec<TableStatus>>,
    },
    Shutdown,
}

/// Handle to a running shard thread.
pub struct ShardHandle {
    shard_id: ThreadId,
    control_tx: Sender<ShardRequest>,
    join: Option<JoinHandle<()>>,
}

impl ShardHandle {
    /// Id the shard receives messages under.
    pub fn shard_id(&self) -> ThreadId {
        self.shard_id
    }

    /// Installs `table` on the shard. Fails if the id is already taken.
    pub fn register_table(&self, table_id: TableId, table: Box<dyn ShardTable>) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.control_tx
            .send(ShardRequest::RegisterTable {
                table_id,
                table,
                respond_to: resp_tx,
            })
            .map_err(|_| self.gone())?;
        resp_rx.recv().map_err(|_| self.gone())?
    }

    /// Asks the shard thread for a snapshot of every table it hosts.
    pub fn status(&self) -> Result<Vec<TableStatus>> {
        let (resp_tx, resp_rx) = unbounded();
        self.control_tx
            .send(ShardRequest::Status {
                respond_to: resp_tx,
            })
            .map_err(|_| self.gone())?;
        resp_rx.recv().map_err(|_| self.gone())
    }

    /// Stops the thread after it has drained its queue, and joins it.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        // The thread may already be gone; joining still reaps it.
        let _ = self.control_tx.send(ShardRequest::Shutdown);
        join.join()
            .map_err(|_| PsError::Transport(format!("shard {} panicked", self.shard_id)))
    }

    fn gone(&self) -> PsError {
        PsError::Transport(format!("shard {} is not running", self.shard_id))
    }
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(shard_id = self.shard_id, error = %err, "shard did not stop cleanly");
        }
    }
}

/// Spawns the processing thread for `shard_id`.
///
/// `inbox` is the shard's queue as registered with the transport; replies
/// are sent back through `transport`.
pub fn spawn_shard(
    shard_id: ThreadId,
    transport: Arc<dyn Transport>,
    inbox: Receiver<Message>,
) -> Result<ShardHandle> {
    let (control_tx, control_rx) = unbounded();
    let join = thread::Builder::new()
        .name(format!("ps-shard-{shard_id}"))
        .spawn(move || ShardWorker::new(shard_id, transport, inbox, control_rx).run())?;
    Ok(ShardHandle {
        shard_id,
        control_tx,
        join: Some(join),
    })
}

struct ShardWorker {
    shard_id: ThreadId,
    transport: Arc<dyn Transport>,
    inbox: Receiver<Message>,
    control_rx: Receiver<ShardRequest>,
    tables: HashMap<TableId, Box<dyn ShardTable>>,
}

impl ShardWorker {
    fn new(
        shard_id: ThreadId,
        transport: Arc<dyn Transport>,
        inbox: Receiver<Message>,
        control_rx: Receiver<ShardRequest>,
    ) -> Self {
        Self {
            shard_id,
            transport,
            inbox,
            control_rx,
            tables: HashMap::new(),
        }
    }

    fn run(mut self) {
        info!(shard_id = self.shard_id, "shard started");
        loop {
            crossbeam_channel::select! {
                recv(self.control_rx) -> req => match req {
                    Ok(req) => {
                        if !self.handle_request(req) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.inbox) -> msg => match msg {
                    Ok(msg) => self.handle_message(msg),
                    Err(_) => break,
                },
            }
        }
        // Whatever was already queued still gets processed.
        while let Ok(msg) = self.inbox.try_recv() {
            self.handle_message(msg);
        }
        info!(shard_id = self.shard_id, tables = self.tables.len(), "shard stopped");
    }

    /// Returns `false` when the shard should stop.
    fn handle_request(&mut self, req: ShardRequest) -> bool {
        match req {
            ShardRequest::RegisterTable {
                table_id,
                table,
                respond_to,
            } => {
                let result = if self.tables.contains_key(&table_id) {
                    Err(PsError::config(format!(
                        "table {table_id} already exists on shard {}",
                        self.shard_id
                    )))
                } else {
                    debug!(shard_id = self.shard_id, table_id, "table registered");
                    self.tables.insert(table_id, table);
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
            ShardRequest::Status { respond_to } => {
                let mut status: Vec<_> = self.tables.values().map(|t| t.status()).collect();
                status.sort_by_key(|s| s.table_id);
                let _ = respond_to.send(status);
            }
            ShardRequest::Shutdown => return false,
        }
        true
    }

    fn handle_message(&mut self, msg: Message) {
        let (sender, op, table_id) = (msg.sender, msg.op, msg.table_id);
        let Some(table) = self.tables.get_mut(&table_id) else {
            warn!(shard_id = self.shard_id, table_id, sender, ?op, "message for unknown table dropped");
            return;
        };
        let replies = match table.handle(msg) {
            Ok(replies) => replies,
            Err(err) => {
                warn!(shard_id = self.shard_id, table_id, sender, ?op, error = %err, "message dropped");
                return;
            }
        };
        for reply in replies {
            let receiver = reply.receiver;
            if let Err(err) = self.transport.send(reply) {
                warn!(shard_id = self.shard_id, table_id, receiver, error = %err, "reply undeliverable");
            }
        }
    }
}
