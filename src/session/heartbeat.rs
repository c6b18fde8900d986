//! Server heartbeat scheduling
//!
//! The server pings an idle-looking client every `interval` and drops it
//! when a ping stays unanswered for `timeout`. Only one ping is ever
//! outstanding.

use std::time::Duration;

use tokio::time::Instant;

use super::state::SessionState;

/// What the connection should do when the heartbeat deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send `ServerHeartbeat { sequence }`
    Send(u16),
    /// The outstanding ping was not answered in time
    TimedOut,
    /// Woke early; nothing due yet
    Wait,
}

/// Heartbeat timer of one session
#[derive(Debug)]
pub struct HeartbeatSchedule {
    interval: Duration,
    timeout: Duration,
    last_sent: Instant,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_sent: Instant::now(),
        }
    }

    /// Next instant the schedule needs attention
    pub fn deadline(&self, state: &SessionState) -> Instant {
        if state.pending_heartbeat.is_some() {
            self.last_sent + self.timeout
        } else {
            self.last_sent + self.interval
        }
    }

    /// Decide what to do at `now`
    pub fn poll(&mut self, state: &mut SessionState, now: Instant) -> HeartbeatAction {
        if now < self.deadline(state) {
            return HeartbeatAction::Wait;
        }
        if state.pending_heartbeat.is_some() {
            return HeartbeatAction::TimedOut;
        }
        self.last_sent = now;
        HeartbeatAction::Send(state.start_heartbeat())
    }
}

/// Sleep until the schedule's deadline, or forever without a schedule
pub async fn wait(schedule: Option<&HeartbeatSchedule>, state: &SessionState) {
    match schedule {
        Some(schedule) => tokio::time::sleep_until(schedule.deadline(state)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_timeout() {
        let mut state = SessionState::new(ConnectionId::new(), None);
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(10), Duration::from_secs(3));
        let start = Instant::now();

        assert_eq!(schedule.poll(&mut state, start), HeartbeatAction::Wait);

        let first = start + Duration::from_secs(10);
        assert_eq!(schedule.poll(&mut state, first), HeartbeatAction::Send(0));
        assert_eq!(schedule.deadline(&state), first + Duration::from_secs(3));

        assert_eq!(
            schedule.poll(&mut state, first + Duration::from_secs(3)),
            HeartbeatAction::TimedOut
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_rearms_interval() {
        let mut state = SessionState::new(ConnectionId::new(), None);
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(10), Duration::from_secs(3));
        let first = Instant::now() + Duration::from_secs(10);

        let HeartbeatAction::Send(sequence) = schedule.poll(&mut state, first) else {
            panic!("expected a ping");
        };
        assert!(state.ack_heartbeat(sequence));

        assert_eq!(schedule.deadline(&state), first + Duration::from_secs(10));
        assert_eq!(
            schedule.poll(&mut state, first + Duration::from_secs(10)),
            HeartbeatAction::Send(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_schedule_never_fires() {
        let state = SessionState::new(ConnectionId::new(), None);
        let waited = tokio::time::timeout(Duration::from_secs(3600), wait(None, &state)).await;
        assert!(waited.is_err());
    }
}
