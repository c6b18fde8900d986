//! Error types
//!
//! Errors are layered the way failures are contained: `DeliveryError` stays
//! inside a group broadcast, `ProtocolError` terminates one session,
//! `BackplaneError` degrades a group to local-only delivery, and `Error`
//! is what surfaces to the hosting process.

use std::fmt;
use std::io;

use crate::connection::ConnectionId;
use crate::protocol::Status;

/// Result type for hubcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying transport
    Io(io::Error),
    /// Malformed or unexpected frame
    Protocol(ProtocolError),
    /// Distributed transport failure
    Backplane(BackplaneError),
    /// Argument or result (de)serialization failed
    Serialization(bincode::Error),
    /// A connection id was registered twice
    DuplicateConnection(ConnectionId),
    /// The hub refused the connection during `on_connecting`
    Rejected(Status),
    /// The remote side answered a call with an error status
    Status(Status),
    /// Group storage was requested with a different type than it was created with
    StorageTypeMismatch(String),
    /// Group storage is not available for distributed groups
    StorageUnsupported(String),
    /// The connection is closed
    ConnectionClosed,
    /// Operation timed out
    Timeout,
    /// Hub code panicked; the session was torn down
    HubPanicked,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Backplane(e) => write!(f, "Backplane error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::DuplicateConnection(id) => write!(f, "Duplicate connection id: {}", id),
            Error::Rejected(status) => write!(f, "Connection rejected: {}", status),
            Error::Status(status) => write!(f, "Call failed: {}", status),
            Error::StorageTypeMismatch(group) => {
                write!(f, "Storage of group '{}' already holds another type", group)
            }
            Error::StorageUnsupported(group) => {
                write!(f, "Storage is not supported on distributed group '{}'", group)
            }
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::HubPanicked => write!(f, "Hub panicked"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Backplane(e) => Some(e),
            Error::Serialization(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<BackplaneError> for Error {
    fn from(e: BackplaneError) -> Self {
        Error::Backplane(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e)
    }
}

/// Wire protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the configured maximum
    FrameTooLarge { size: usize, max: usize },
    /// Frame ended before all fields were read
    UnexpectedEof,
    /// Unknown message type byte
    UnknownMessageType(u8),
    /// Error message was not valid UTF-8
    InvalidUtf8,
    /// Method id is not registered on the hub
    UnknownMethod(i32),
    /// Message is valid but not allowed in this direction or state
    UnexpectedMessage(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {} bytes (max {})", size, max)
            }
            ProtocolError::UnexpectedEof => write!(f, "Unexpected end of frame"),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: 0x{:02x}", t),
            ProtocolError::InvalidUtf8 => write!(f, "Invalid UTF-8 string"),
            ProtocolError::UnknownMethod(id) => write!(f, "Unknown method id: {}", id),
            ProtocolError::UnexpectedMessage(what) => write!(f, "Unexpected message: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Distributed transport errors
#[derive(Debug)]
pub enum BackplaneError {
    /// Backend could not be reached or refused the command
    Unavailable(String),
    /// Received envelope could not be decoded
    InvalidEnvelope(&'static str),
    /// Subscription stream ended
    SubscriptionClosed,
    /// Redis client error
    #[cfg(feature = "redis")]
    Redis(redis::RedisError),
}

impl fmt::Display for BackplaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackplaneError::Unavailable(msg) => write!(f, "Backplane unavailable: {}", msg),
            BackplaneError::InvalidEnvelope(msg) => write!(f, "Invalid envelope: {}", msg),
            BackplaneError::SubscriptionClosed => write!(f, "Subscription closed"),
            #[cfg(feature = "redis")]
            BackplaneError::Redis(e) => write!(f, "Redis error: {}", e),
        }
    }
}

impl std::error::Error for BackplaneError {}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BackplaneError {
    fn from(e: redis::RedisError) -> Self {
        BackplaneError::Redis(e)
    }
}

/// Failure to push one frame to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The recipient's session is gone
    Closed,
    /// The recipient's outbound queue stayed full for the whole delivery timeout
    Timeout,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "recipient closed"),
            DeliveryError::Timeout => write!(f, "recipient queue full"),
        }
    }
}

impl std::error::Error for DeliveryError {}
