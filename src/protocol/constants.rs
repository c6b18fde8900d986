//! Protocol constants

/// Size of the frame length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame body size (4MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Message id used when a frame is not correlated with a call
pub const NO_MESSAGE_ID: i32 = -1;

// Client -> server message types
pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_REQUEST_FIRE_AND_FORGET: u8 = 0x02;
pub const MSG_CLIENT_HEARTBEAT: u8 = 0x03;
pub const MSG_SERVER_HEARTBEAT_RESPONSE: u8 = 0x04;

// Server -> client message types
pub const MSG_READY: u8 = 0x10;
pub const MSG_RESPONSE: u8 = 0x11;
pub const MSG_ERROR: u8 = 0x12;
pub const MSG_BROADCAST: u8 = 0x13;
pub const MSG_SERVER_HEARTBEAT: u8 = 0x14;
pub const MSG_CLIENT_HEARTBEAT_RESPONSE: u8 = 0x15;
