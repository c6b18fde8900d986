//! Session state machine
//!
//! Tracks one hub connection from accept to teardown.
//!
//! ```text
//! Connecting ──activate──► Active ──begin_disconnect──► Disconnecting ──finish──► Disconnected
//!      │                                                      ▲
//!      └──────────────────begin_disconnect────────────────────┘
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::connection::ConnectionId;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Stream accepted, `on_connecting` not finished
    Connecting,
    /// Ready sent; calls and broadcasts flow
    Active,
    /// Teardown in progress
    Disconnecting,
    /// Teardown complete
    Disconnected,
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Connection id
    pub id: ConnectionId,

    /// Remote peer address, if the transport has one
    pub peer_addr: Option<SocketAddr>,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Time the session became active
    pub activated_at: Option<Instant>,

    /// Hub calls dispatched on this session
    pub invocations: u64,

    /// Sequence number of the next server heartbeat
    pub next_heartbeat: u16,

    /// Outstanding server heartbeat (sequence, sent at)
    pub pending_heartbeat: Option<(u16, Instant)>,

    /// Round trip of the last acknowledged server heartbeat
    pub last_latency: Option<Duration>,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: ConnectionId, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Connecting,
            connected_at: Instant::now(),
            activated_at: None,
            invocations: 0,
            next_heartbeat: 0,
            pending_heartbeat: None,
            last_latency: None,
        }
    }

    /// Move from `Connecting` to `Active`
    pub fn activate(&mut self) -> bool {
        if self.phase != SessionPhase::Connecting {
            return false;
        }
        self.phase = SessionPhase::Active;
        self.activated_at = Some(Instant::now());
        true
    }

    /// Start teardown
    ///
    /// Returns true only for the first caller, which then owns the teardown.
    pub fn begin_disconnect(&mut self) -> bool {
        match self.phase {
            SessionPhase::Connecting | SessionPhase::Active => {
                self.phase = SessionPhase::Disconnecting;
                true
            }
            SessionPhase::Disconnecting | SessionPhase::Disconnected => false,
        }
    }

    /// Mark teardown complete
    pub fn finish(&mut self) {
        self.phase = SessionPhase::Disconnected;
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Allocate the next server heartbeat and mark it outstanding
    pub fn start_heartbeat(&mut self) -> u16 {
        let sequence = self.next_heartbeat;
        self.next_heartbeat = self.next_heartbeat.wrapping_add(1);
        self.pending_heartbeat = Some((sequence, Instant::now()));
        sequence
    }

    /// Record a heartbeat acknowledgement
    ///
    /// Returns false for acknowledgements that do not match the outstanding
    /// heartbeat.
    pub fn ack_heartbeat(&mut self, sequence: u16) -> bool {
        match self.pending_heartbeat {
            Some((pending, sent_at)) if pending == sequence => {
                self.pending_heartbeat = None;
                self.last_latency = Some(sent_at.elapsed());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn state() -> SessionState {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7070);
        SessionState::new(ConnectionId::new(), Some(addr))
    }

    #[test]
    fn test_session_lifecycle() {
        let mut state = state();
        assert_eq!(state.phase, SessionPhase::Connecting);

        assert!(state.activate());
        assert_eq!(state.phase, SessionPhase::Active);
        assert!(state.activated_at.is_some());
        assert!(!state.activate());

        assert!(state.begin_disconnect());
        assert_eq!(state.phase, SessionPhase::Disconnecting);

        state.finish();
        assert_eq!(state.phase, SessionPhase::Disconnected);
    }

    #[test]
    fn test_begin_disconnect_only_once() {
        let mut state = state();
        state.activate();

        assert!(state.begin_disconnect());
        assert!(!state.begin_disconnect());
        state.finish();
        assert!(!state.begin_disconnect());
    }

    #[test]
    fn test_rejected_session_skips_active() {
        let mut state = state();

        assert!(state.begin_disconnect());
        assert!(!state.activate());
        assert_eq!(state.phase, SessionPhase::Disconnecting);
    }

    #[test]
    fn test_heartbeat_ack() {
        let mut state = state();

        let first = state.start_heartbeat();
        assert!(!state.ack_heartbeat(first.wrapping_add(1)));
        assert!(state.ack_heartbeat(first));
        assert!(state.last_latency.is_some());
        assert!(!state.ack_heartbeat(first));

        let second = state.start_heartbeat();
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_heartbeat_sequence_wraps() {
        let mut state = state();
        state.next_heartbeat = u16::MAX;

        assert_eq!(state.start_heartbeat(), u16::MAX);
        assert_eq!(state.start_heartbeat(), 0);
    }
}
