//! Session management
//!
//! A session is the server side of one hub connection: its lifecycle
//! state, its heartbeat schedule and the context its hub instance works
//! through.

pub mod context;
pub mod heartbeat;
pub mod state;

pub use context::{HubContext, HubGroups};
pub use heartbeat::{HeartbeatAction, HeartbeatSchedule};
pub use state::{SessionPhase, SessionState};
