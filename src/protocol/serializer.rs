//! Argument serialization
//!
//! A single argument is encoded directly; several arguments are encoded as a
//! tuple, so `(String, u32)` on the sending side decodes into
//! `(String, u32)` on the receiving side.

use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::constants::DEFAULT_MAX_FRAME_SIZE;
use super::message::BroadcastMessage;

/// Encodes hub arguments, results and broadcast payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSerializer {
    max_payload_size: u64,
}

impl BroadcastSerializer {
    /// Create a serializer that refuses payloads above `max_payload_size` bytes
    pub fn new(max_payload_size: u64) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> u64 {
        self.max_payload_size
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.max_payload_size)
    }

    /// Serialize a value
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, bincode::Error> {
        self.options().serialize(value).map(Bytes::from)
    }

    /// Deserialize a value
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, bincode::Error> {
        self.options().deserialize(payload)
    }

    /// Serialize `args` once into a broadcast message for `method_id`
    pub fn message<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        args: &T,
    ) -> Result<BroadcastMessage, bincode::Error> {
        Ok(BroadcastMessage::new(method_id, self.encode(args)?))
    }
}

impl Default for BroadcastSerializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE as u64)
    }
}
