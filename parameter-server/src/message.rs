//! The unit of communication between worker threads and shard threads.
//!
//! A [`Message`] carries routing metadata plus an ordered list of flat,
//! homogeneously typed [`ArrayBlock`]s. Add messages carry `[keys, values]`,
//! Get messages carry `[keys]`, Get responses carry `[keys, values]`.

use std::fmt::Debug;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::error::{PsError, Result};

/// One scalar slot in a table's key space.
pub type Key = u64;
/// Per-sender iteration counter.
pub type Clock = u64;
/// Identifier of a shard thread or a worker (app) thread.
pub type ThreadId = u32;
pub type TableId = u32;

/// Operation tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Add,
    Get,
    Clock,
    Response,
    /// Pins the set of workers a shard expects clocks from.
    ResetWorkers,
}

/// A flat, homogeneously typed sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayBlock {
    Keys(Vec<Key>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl ArrayBlock {
    /// Number of elements in the block.
    pub fn len(&self) -> usize {
        match self {
            ArrayBlock::Keys(v) => v.len(),
            ArrayBlock::F32(v) => v.len(),
            ArrayBlock::F64(v) => v.len(),
            ArrayBlock::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            ArrayBlock::Keys(_) => "keys",
            ArrayBlock::F32(_) => "f32",
            ArrayBlock::F64(_) => "f64",
            ArrayBlock::I64(_) => "i64",
        }
    }
}

/// Element type a table stores.
///
/// `Default` is the value an untouched key reads as.
pub trait Value: Copy + Default + PartialEq + AddAssign + Debug + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn into_block(values: Vec<Self>) -> ArrayBlock;

    fn from_block(block: &ArrayBlock) -> Option<&[Self]>;
}

macro_rules! impl_value {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl Value for $ty {
            const TYPE_NAME: &'static str = $name;

            fn into_block(values: Vec<Self>) -> ArrayBlock {
                ArrayBlock::$variant(values)
            }

            fn from_block(block: &ArrayBlock) -> Option<&[Self]> {
                match block {
                    ArrayBlock::$variant(values) => Some(values.as_slice()),
                    _ => None,
                }
            }
        }
    };
}

impl_value!(f32, F32, "f32");
impl_value!(f64, F64, "f64");
impl_value!(i64, I64, "i64");

/// One request or response exchanged between workers and shards.
///
/// The payload is a list of typed blocks: keys first, then values when the
/// operation carries any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: ThreadId,
    pub receiver: ThreadId,
    pub table_id: TableId,
    pub op: Op,
    /// Sender's clock when the message was issued. For `Clock` messages this
    /// is the value the sender has just advanced to.
    pub clock: Clock,
    /// Correlates a Get with its responses. Zero for fire-and-forget ops.
    pub request_id: u64,
    pub data: Vec<ArrayBlock>,
}

impl Message {
    /// A message with no payload, clock 0 and no request id.
    pub fn new(op: Op, sender: ThreadId, receiver: ThreadId, table_id: TableId) -> Self {
        Self {
            sender,
            receiver,
            table_id,
            op,
            clock: 0,
            request_id: 0,
            data: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_block(mut self, block: ArrayBlock) -> Self {
        self.data.push(block);
        self
    }

    /// Builds the response to this request, addressed back to its sender.
    pub fn reply(&self) -> Message {
        Message::new(Op::Response, self.receiver, self.sender, self.table_id)
            .with_clock(self.clock)
            .with_request_id(self.request_id)
    }

    /// The key block, which is always the first block.
    pub fn keys(&self) -> Result<&[Key]> {
        match self.data.first() {
            Some(ArrayBlock::Keys(keys)) => Ok(keys.as_slice()),
            Some(other) => Err(PsError::malformed(format!(
                "first block must hold keys, found {}",
                other.type_name()
            ))),
            None => Err(PsError::malformed("message has no key block")),
        }
    }

    /// The value block, which is always the second block.
    pub fn values<V: Value>(&self) -> Result<&[V]> {
        let block = self
            .data
            .get(1)
            .ok_or_else(|| PsError::malformed("message has no value block"))?;
        V::from_block(block).ok_or_else(|| {
            PsError::malformed(format!(
                "value block holds {}, table stores {}",
                block.type_name(),
                V::TYPE_NAME
            ))
        })
    }

    /// Serializes the message with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses bytes produced by [`Message::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_swaps_endpoints_and_keeps_correlation() {
        let get = Message::new(Op::Get, 15, 1, 23)
            .with_clock(4)
            .with_request_id(9)
            .with_block(ArrayBlock::Keys(vec![4, 5]));
        let resp = get.reply();
        assert_eq!(resp.op, Op::Response);
        assert_eq!((resp.sender, resp.receiver), (1, 15));
        assert_eq!(resp.table_id, 23);
        assert_eq!(resp.request_id, 9);
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_typed_value_access_rejects_wrong_type() {
        let msg = Message::new(Op::Add, 0, 1, 0)
            .with_block(ArrayBlock::Keys(vec![1]))
            .with_block(f64::into_block(vec![0.5]));
        assert_eq!(msg.values::<f64>().unwrap(), &[0.5]);
        assert!(matches!(
            msg.values::<f32>(),
            Err(PsError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_missing_key_block_is_malformed() {
        let msg = Message::new(Op::Get, 0, 1, 0).with_block(ArrayBlock::F32(vec![1.0]));
        assert!(matches!(msg.keys(), Err(PsError::MalformedMessage(_))));
        let empty = Message::new(Op::Get, 0, 1, 0);
        assert!(matches!(empty.keys(), Err(PsError::MalformedMessage(_))));
    }

    #[test]
    fn test_codec_preserves_blocks() {
        let msg = Message::new(Op::Add, 7, 2, 3)
            .with_clock(11)
            .with_block(ArrayBlock::Keys(vec![3, 4, 5]))
            .with_block(ArrayBlock::F32(vec![0.1, 0.2, 0.3]));
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode(&[0xff; 3]), Err(PsError::Codec(_))));
    }
}
