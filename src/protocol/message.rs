//! Hub protocol messages
//!
//! ```text
//! Client -> Server
//!   Request                  [0x01][message_id i32][method_id i32][args ..]
//!   RequestFireAndForget     [0x02][method_id i32][args ..]
//!   ClientHeartbeat          [0x03][sequence u16][sent_at_ms i64][extra ..]
//!   ServerHeartbeatResponse  [0x04][sequence u16]
//!
//! Server -> Client
//!   Ready                    [0x10][connection_id 16]
//!   Response                 [0x11][message_id i32][method_id i32][payload ..]
//!   Error                    [0x12][message_id i32][code u16][len u32][message]
//!   Broadcast                [0x13][method_id i32][payload ..]
//!   ServerHeartbeat          [0x14][sequence u16]
//!   ClientHeartbeatResponse  [0x15][sequence u16][sent_at_ms i64][extra ..]
//! ```
//!
//! Trailing payloads run to the end of the frame, so they are carried as
//! `Bytes` slices of the received frame without copying.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::encode_frame;
use super::constants::*;
use super::status::{Status, StatusCode};
use crate::connection::ConnectionId;
use crate::error::ProtocolError;

/// A broadcast invocation: receiver method id plus serialized arguments
///
/// The outbound frame is built once in [`BroadcastMessage::new`]; cloning the
/// message (or its frame) only bumps reference counts, so one broadcast shares
/// a single allocation across every recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    method_id: i32,
    payload: Bytes,
    frame: Bytes,
}

impl BroadcastMessage {
    /// Create a broadcast message and pre-encode its outbound frame
    pub fn new(method_id: i32, payload: Bytes) -> Self {
        let mut body = BytesMut::with_capacity(5 + payload.len());
        body.put_u8(MSG_BROADCAST);
        body.put_i32(method_id);
        body.put_slice(&payload);
        let frame = encode_frame(&body);

        Self {
            method_id,
            payload,
            frame,
        }
    }

    /// Receiver-side method id
    pub fn method_id(&self) -> i32 {
        self.method_id
    }

    /// Serialized arguments
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Complete length-prefixed frame, ready to write to a stream
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Hub call that expects a response correlated by `message_id`
    Request {
        message_id: i32,
        method_id: i32,
        args: Bytes,
    },
    /// Hub call without a response
    RequestFireAndForget { method_id: i32, args: Bytes },
    /// Client-initiated ping; echoed back by the server
    ClientHeartbeat {
        sequence: u16,
        sent_at_ms: i64,
        extra: Bytes,
    },
    /// Acknowledgement of a `ServerMessage::ServerHeartbeat`
    ServerHeartbeatResponse { sequence: u16 },
}

impl ClientMessage {
    /// Encode to a frame body (without length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ClientMessage::Request {
                message_id,
                method_id,
                args,
            } => {
                buf.reserve(9 + args.len());
                buf.put_u8(MSG_REQUEST);
                buf.put_i32(*message_id);
                buf.put_i32(*method_id);
                buf.put_slice(args);
            }
            ClientMessage::RequestFireAndForget { method_id, args } => {
                buf.reserve(5 + args.len());
                buf.put_u8(MSG_REQUEST_FIRE_AND_FORGET);
                buf.put_i32(*method_id);
                buf.put_slice(args);
            }
            ClientMessage::ClientHeartbeat {
                sequence,
                sent_at_ms,
                extra,
            } => {
                buf.put_u8(MSG_CLIENT_HEARTBEAT);
                buf.put_u16(*sequence);
                buf.put_i64(*sent_at_ms);
                buf.put_slice(extra);
            }
            ClientMessage::ServerHeartbeatResponse { sequence } => {
                buf.put_u8(MSG_SERVER_HEARTBEAT_RESPONSE);
                buf.put_u16(*sequence);
            }
        }
        buf.freeze()
    }

    /// Encode including the length prefix
    pub fn to_frame(&self) -> Bytes {
        encode_frame(&self.encode())
    }

    /// Decode a frame body
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let msg_type = read_u8(&mut body)?;
        match msg_type {
            MSG_REQUEST => {
                let message_id = read_i32(&mut body)?;
                let method_id = read_i32(&mut body)?;
                Ok(ClientMessage::Request {
                    message_id,
                    method_id,
                    args: body,
                })
            }
            MSG_REQUEST_FIRE_AND_FORGET => {
                let method_id = read_i32(&mut body)?;
                Ok(ClientMessage::RequestFireAndForget {
                    method_id,
                    args: body,
                })
            }
            MSG_CLIENT_HEARTBEAT => {
                let sequence = read_u16(&mut body)?;
                let sent_at_ms = read_i64(&mut body)?;
                Ok(ClientMessage::ClientHeartbeat {
                    sequence,
                    sent_at_ms,
                    extra: body,
                })
            }
            MSG_SERVER_HEARTBEAT_RESPONSE => {
                let sequence = read_u16(&mut body)?;
                Ok(ClientMessage::ServerHeartbeatResponse { sequence })
            }
            MSG_READY | MSG_RESPONSE | MSG_ERROR | MSG_BROADCAST | MSG_SERVER_HEARTBEAT
            | MSG_CLIENT_HEARTBEAT_RESPONSE => Err(ProtocolError::UnexpectedMessage(
                "server message sent by client",
            )),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Stream marker: the session is active and may receive broadcasts
    Ready { connection_id: ConnectionId },
    /// Successful result of a `Request`
    Response {
        message_id: i32,
        method_id: i32,
        payload: Bytes,
    },
    /// Failed call, or a session-level error when `message_id` is `NO_MESSAGE_ID`
    Error { message_id: i32, status: Status },
    /// Group broadcast
    Broadcast(BroadcastMessage),
    /// Server-initiated ping
    ServerHeartbeat { sequence: u16 },
    /// Echo of a `ClientHeartbeat`
    ClientHeartbeatResponse {
        sequence: u16,
        sent_at_ms: i64,
        extra: Bytes,
    },
}

impl ServerMessage {
    /// Encode to a frame body (without length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::Ready { connection_id } => {
                buf.put_u8(MSG_READY);
                buf.put_slice(connection_id.as_bytes());
            }
            ServerMessage::Response {
                message_id,
                method_id,
                payload,
            } => {
                buf.reserve(9 + payload.len());
                buf.put_u8(MSG_RESPONSE);
                buf.put_i32(*message_id);
                buf.put_i32(*method_id);
                buf.put_slice(payload);
            }
            ServerMessage::Error { message_id, status } => {
                buf.put_u8(MSG_ERROR);
                buf.put_i32(*message_id);
                buf.put_u16(status.code.as_u16());
                buf.put_u32(status.message.len() as u32);
                buf.put_slice(status.message.as_bytes());
            }
            ServerMessage::Broadcast(message) => {
                // The frame already carries the length prefix
                return message.frame().slice(FRAME_HEADER_SIZE..);
            }
            ServerMessage::ServerHeartbeat { sequence } => {
                buf.put_u8(MSG_SERVER_HEARTBEAT);
                buf.put_u16(*sequence);
            }
            ServerMessage::ClientHeartbeatResponse {
                sequence,
                sent_at_ms,
                extra,
            } => {
                buf.put_u8(MSG_CLIENT_HEARTBEAT_RESPONSE);
                buf.put_u16(*sequence);
                buf.put_i64(*sent_at_ms);
                buf.put_slice(extra);
            }
        }
        buf.freeze()
    }

    /// Encode including the length prefix
    pub fn to_frame(&self) -> Bytes {
        match self {
            ServerMessage::Broadcast(message) => message.frame().clone(),
            other => encode_frame(&other.encode()),
        }
    }

    /// Decode a frame body
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let msg_type = read_u8(&mut body)?;
        match msg_type {
            MSG_READY => {
                let connection_id = read_connection_id(&mut body)?;
                Ok(ServerMessage::Ready { connection_id })
            }
            MSG_RESPONSE => {
                let message_id = read_i32(&mut body)?;
                let method_id = read_i32(&mut body)?;
                Ok(ServerMessage::Response {
                    message_id,
                    method_id,
                    payload: body,
                })
            }
            MSG_ERROR => {
                let message_id = read_i32(&mut body)?;
                let code = StatusCode::from_u16(read_u16(&mut body)?);
                let len = read_u32(&mut body)? as usize;
                if body.remaining() < len {
                    return Err(ProtocolError::UnexpectedEof);
                }
                let message = String::from_utf8(body.split_to(len).to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(ServerMessage::Error {
                    message_id,
                    status: Status::new(code, message),
                })
            }
            MSG_BROADCAST => {
                let method_id = read_i32(&mut body)?;
                Ok(ServerMessage::Broadcast(BroadcastMessage::new(method_id, body)))
            }
            MSG_SERVER_HEARTBEAT => {
                let sequence = read_u16(&mut body)?;
                Ok(ServerMessage::ServerHeartbeat { sequence })
            }
            MSG_CLIENT_HEARTBEAT_RESPONSE => {
                let sequence = read_u16(&mut body)?;
                let sent_at_ms = read_i64(&mut body)?;
                Ok(ServerMessage::ClientHeartbeatResponse {
                    sequence,
                    sent_at_ms,
                    extra: body,
                })
            }
            MSG_REQUEST
            | MSG_REQUEST_FIRE_AND_FORGET
            | MSG_CLIENT_HEARTBEAT
            | MSG_SERVER_HEARTBEAT_RESPONSE => Err(ProtocolError::UnexpectedMessage(
                "client message sent by server",
            )),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(buf.get_i32())
}

fn read_i64(buf: &mut Bytes) -> Result<i64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(buf.get_i64())
}

pub(crate) fn read_connection_id(buf: &mut Bytes) -> Result<ConnectionId, ProtocolError> {
    if buf.remaining() < 16 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(ConnectionId::from_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let msg = ClientMessage::Request {
            message_id: 7,
            method_id: 42,
            args: Bytes::from_static(b"hi"),
        };
        let body = msg.encode();
        assert_eq!(
            &body[..],
            &[MSG_REQUEST, 0, 0, 0, 7, 0, 0, 0, 42, b'h', b'i']
        );
        assert_eq!(ClientMessage::decode(body).unwrap(), msg);
    }

    #[test]
    fn test_broadcast_frame_is_shared() {
        let message = BroadcastMessage::new(42, Bytes::from_static(b"hello"));
        let frame = message.frame().clone();

        // Length prefix + type + method id + payload
        assert_eq!(frame.len(), 4 + 1 + 4 + 5);
        assert_eq!(&frame[..4], &[0, 0, 0, 10]);

        // Cloning shares the same allocation
        let copy = message.clone();
        assert_eq!(copy.frame().as_ptr(), frame.as_ptr());

        let decoded = ServerMessage::decode(frame.slice(4..)).unwrap();
        match decoded {
            ServerMessage::Broadcast(b) => {
                assert_eq!(b.method_id(), 42);
                assert_eq!(&b.payload()[..], b"hello");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_message() {
        let msg = ServerMessage::Error {
            message_id: 3,
            status: Status::unimplemented("nope"),
        };
        let decoded = ServerMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ready_carries_connection_id() {
        let id = ConnectionId::new();
        let decoded = ServerMessage::decode(ServerMessage::Ready { connection_id: id }.encode());
        assert_eq!(decoded, Ok(ServerMessage::Ready { connection_id: id }));
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            ClientMessage::decode(Bytes::from_static(&[MSG_REQUEST, 0, 0])),
            Err(ProtocolError::UnexpectedEof)
        );
        assert_eq!(
            ClientMessage::decode(Bytes::new()),
            Err(ProtocolError::UnexpectedEof)
        );
        // Declared message length longer than the frame
        assert_eq!(
            ServerMessage::decode(Bytes::from_static(&[
                MSG_ERROR, 0, 0, 0, 1, 0, 13, 0, 0, 0, 9, b'x'
            ])),
            Err(ProtocolError::UnexpectedEof)
        );
    }

    #[test]
    fn test_wrong_direction_and_unknown_type() {
        assert!(matches!(
            ClientMessage::decode(Bytes::from_static(&[MSG_BROADCAST, 0, 0, 0, 1])),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
        assert_eq!(
            ClientMessage::decode(Bytes::from_static(&[0x7f])),
            Err(ProtocolError::UnknownMessageType(0x7f))
        );
    }

    #[test]
    fn test_heartbeat_echo_keeps_extra() {
        let ping = ClientMessage::ClientHeartbeat {
            sequence: 9,
            sent_at_ms: 1_700_000_000_000,
            extra: Bytes::from_static(b"rtt"),
        };
        match ClientMessage::decode(ping.encode()).unwrap() {
            ClientMessage::ClientHeartbeat {
                sequence,
                sent_at_ms,
                extra,
            } => {
                let pong = ServerMessage::ClientHeartbeatResponse {
                    sequence,
                    sent_at_ms,
                    extra,
                };
                let decoded = ServerMessage::decode(pong.encode()).unwrap();
                assert_eq!(decoded, pong);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
