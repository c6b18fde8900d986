//! Hub server
//!
//! [`HubServer`] accepts connections, creates one hub instance per
//! connection, and drives each session on its own task.

pub mod config;
pub(crate) mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use listener::HubServer;
