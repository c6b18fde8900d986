//! Backplane envelope
//!
//! ```text
//! [version u8][origin 16][except u8][count u32][connection ids 16 * count]
//! [method_id i32][payload ..]
//! ```
//!
//! `except = 1` with no ids addresses every member; `except = 0` addresses
//! only the listed ids.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::NodeId;
use crate::connection::ConnectionId;
use crate::error::BackplaneError;
use crate::group::Recipients;
use crate::protocol::message::read_connection_id;
use crate::protocol::BroadcastMessage;

/// Current envelope layout version
pub const ENVELOPE_VERSION: u8 = 1;

/// A broadcast relayed through the backplane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedEnvelope {
    pub origin: NodeId,
    pub recipients: Recipients,
    pub message: BroadcastMessage,
}

impl DistributedEnvelope {
    pub fn new(origin: NodeId, recipients: Recipients, message: BroadcastMessage) -> Self {
        Self {
            origin,
            recipients,
            message,
        }
    }

    /// Encode for publishing
    pub fn encode(&self) -> Bytes {
        let (except, ids): (bool, &[ConnectionId]) = match &self.recipients {
            Recipients::All => (true, &[]),
            Recipients::Except(ids) => (true, ids),
            Recipients::Only(ids) => (false, ids),
        };
        let payload = self.message.payload();

        let mut buf = BytesMut::with_capacity(26 + ids.len() * 16 + 4 + payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_slice(self.origin.as_bytes());
        buf.put_u8(except as u8);
        buf.put_u32(ids.len() as u32);
        for id in ids {
            buf.put_slice(id.as_bytes());
        }
        buf.put_i32(self.message.method_id());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a received envelope
    pub fn decode(mut buf: Bytes) -> Result<Self, BackplaneError> {
        if buf.remaining() < 1 + 16 + 1 + 4 {
            return Err(BackplaneError::InvalidEnvelope("truncated header"));
        }
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(BackplaneError::InvalidEnvelope("unsupported version"));
        }

        let mut origin = [0u8; 16];
        buf.copy_to_slice(&mut origin);
        let except = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return Err(BackplaneError::InvalidEnvelope("invalid recipient mode")),
        };

        let count = buf.get_u32() as usize;
        if buf.remaining() / 16 < count {
            return Err(BackplaneError::InvalidEnvelope("truncated recipient list"));
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = read_connection_id(&mut buf)
                .map_err(|_| BackplaneError::InvalidEnvelope("truncated recipient list"))?;
            ids.push(id);
        }

        if buf.remaining() < 4 {
            return Err(BackplaneError::InvalidEnvelope("missing method id"));
        }
        let method_id = buf.get_i32();

        let recipients = match (except, ids.is_empty()) {
            (true, true) => Recipients::All,
            (true, false) => Recipients::Except(ids),
            (false, _) => Recipients::Only(ids),
        };

        Ok(Self {
            origin: NodeId::from_bytes(origin),
            recipients,
            message: BroadcastMessage::new(method_id, buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> BroadcastMessage {
        BroadcastMessage::new(7, Bytes::from_static(b"payload"))
    }

    #[test]
    fn test_except_mode_keeps_ids() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let envelope =
            DistributedEnvelope::new(NodeId::new(), Recipients::Except(vec![a, b]), message());

        let decoded = DistributedEnvelope::decode(envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_empty_except_is_all() {
        let envelope = DistributedEnvelope::new(NodeId::new(), Recipients::All, message());
        let encoded = envelope.encode();
        assert_eq!(encoded[17], 1);

        let decoded = DistributedEnvelope::decode(encoded).unwrap();
        assert_eq!(decoded.recipients, Recipients::All);
        assert_eq!(&decoded.message.payload()[..], b"payload");
    }

    #[test]
    fn test_empty_only_addresses_nobody() {
        let envelope = DistributedEnvelope::new(NodeId::new(), Recipients::Only(vec![]), message());
        let decoded = DistributedEnvelope::decode(envelope.encode()).unwrap();
        assert_eq!(decoded.recipients, Recipients::Only(vec![]));
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        assert!(DistributedEnvelope::decode(Bytes::from_static(&[1, 2, 3])).is_err());

        let mut encoded = DistributedEnvelope::new(NodeId::new(), Recipients::All, message())
            .encode()
            .to_vec();
        encoded[0] = 9;
        assert!(matches!(
            DistributedEnvelope::decode(Bytes::from(encoded)),
            Err(BackplaneError::InvalidEnvelope("unsupported version"))
        ));

        // Declares a recipient that is not present
        let mut short = BytesMut::new();
        short.put_u8(ENVELOPE_VERSION);
        short.put_slice(&[0u8; 16]);
        short.put_u8(0);
        short.put_u32(1);
        assert!(DistributedEnvelope::decode(short.freeze()).is_err());
    }
}
