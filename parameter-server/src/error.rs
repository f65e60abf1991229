//! Error taxonomy shared by the client, router, storage and shard threads.

use crate::message::Key;

/// Errors surfaced by the parameter server.
///
/// Server-side `KeyOutOfRange` and `MalformedMessage` never travel back to a
/// worker: the shard thread logs them and drops the offending message.
#[derive(thiserror::Error, Debug)]
pub enum PsError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("key {key} is outside every configured range")]
    KeyOutOfRange { key: Key },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("request {request_id} timed out")]
    Timeout { request_id: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T, E = PsError> = std::result::Result<T, E>;

impl PsError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PsError::Config(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        PsError::MalformedMessage(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        PsError::ProtocolViolation(msg.into())
    }
}
