//! In-process parameter server with pluggable consistency models.
//!
//! Workers read and update a sharded key-value table while iterating. Every
//! table is split into key ranges, one per shard, and each shard enforces
//! the table's consistency model (ASP, BSP, SSP or sparse SSP) against the
//! clocks its workers report.
//!
//! # Architecture
//!
//! - **Shard threads** ([`runtime`]): one per shard. Each owns the tables it
//!   hosts and handles messages one at a time, so models and storage need no
//!   locks.
//! - **Worker threads**: each holds a [`KvClientTable`] per table. Add and
//!   Clock are fire-and-forget; Get blocks until every queried shard answered.
//! - **Transport** ([`transport`]): crossbeam channels, one queue per shard
//!   and one response inbox per (worker, table).
//!
//! ```text
//! worker --Add/Get/Clock--> Mailbox --> shard queue --> ConsistencyModel
//!   ^                                                         |
//!   +------------------ Response <-- Mailbox <----------------+
//! ```
//!
//! # Modules
//!
//! - [`topology`]: key ranges and the router mapping keys to shards
//! - [`message`]: messages, array blocks and the wire codec
//! - [`store`]: sparse and dense per-shard storage
//! - [`pending`]: clock-indexed buffer of deferred messages
//! - [`progress`]: per-worker clocks and their minimum
//! - [`model`]: the consistency models
//! - [`client`]: the worker-side table handle
//! - [`engine`]: shard lifecycle and table creation

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod model;
pub mod pending;
pub mod progress;
pub mod runtime;
pub mod store;
pub mod topology;
pub mod transport;

pub use client::KvClientTable;
pub use config::{EngineConfig, TableConfig};
pub use engine::Engine;
pub use error::{PsError, Result};
pub use message::{Clock, Key, Message, TableId, ThreadId, Value};
pub use model::recorder::RecorderKind;
pub use model::ModelKind;
pub use store::StorageKind;
pub use topology::{KeyRange, RangeRouter};
