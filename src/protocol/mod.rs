//! Hub wire protocol
//!
//! Every frame on a hub connection is a `u32` big-endian length prefix
//! followed by a one-byte message type and the message fields:
//!
//! ```text
//! +----------------+------+---------------------------+
//! | length (u32be) | type | fields ...                |
//! +----------------+------+---------------------------+
//! ```
//!
//! Hub arguments, return values and broadcast arguments are opaque
//! payloads produced by [`BroadcastSerializer`].

pub mod codec;
pub mod constants;
pub mod message;
pub mod serializer;
pub mod status;

pub use codec::{encode_frame, FrameReader};
pub use message::{BroadcastMessage, ClientMessage, ServerMessage};
pub use serializer::BroadcastSerializer;
pub use status::{Status, StatusCode};
