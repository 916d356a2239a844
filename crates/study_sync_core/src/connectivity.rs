//! crates/study_sync_core/src/connectivity.rs
//!
//! Classifies a group's relay channel as connecting, connected or disconnected and
//! decides when to fall back to polling and when to re-subscribe.

use crate::ports::ChannelStatus;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameConnected,
    BecameDisconnected,
}

/// What to do about a failed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    RetryAfter(Duration),
    /// Retries are exhausted; polling carries the session from here on.
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct ConnectivityController {
    state: ConnectionState,
    confirm_delay: Duration,
    pending_since: Option<Instant>,
    attempts: u32,
    policy: RetryPolicy,
}

impl ConnectivityController {
    pub fn new(confirm_delay: Duration, policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Connecting,
            confirm_delay,
            pending_since: None,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Polling runs whenever broadcast delivery cannot be trusted.
    pub fn should_poll(&self) -> bool {
        self.state != ConnectionState::Connected
    }

    /// A (re)subscription attempt is in flight.
    pub fn begin_connecting(&mut self) -> Transition {
        self.pending_since = None;
        self.set_state(ConnectionState::Connecting)
    }

    /// Feeds a relay status. `Subscribed` only arms the confirmation timer; the channel
    /// counts as connected once `poll_confirm` sees the delay elapse.
    pub fn on_status(&mut self, status: ChannelStatus, now: Instant) -> (Transition, Option<Recovery>) {
        match status {
            ChannelStatus::Subscribed => {
                if self.state != ConnectionState::Connected {
                    self.pending_since = Some(now);
                }
                (Transition::Unchanged, None)
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                let transition = self.fail();
                let recovery = self.next_recovery(|policy, attempt| policy.base_delay * 2u32.pow(attempt));
                (transition, Some(recovery))
            }
            ChannelStatus::Closed => {
                let transition = self.fail();
                let recovery = self.next_recovery(|policy, _| policy.base_delay);
                (transition, Some(recovery))
            }
        }
    }

    pub fn confirm_deadline(&self) -> Option<Instant> {
        self.pending_since.map(|since| since + self.confirm_delay)
    }

    pub fn poll_confirm(&mut self, now: Instant) -> Transition {
        match self.confirm_deadline() {
            Some(deadline) if now >= deadline => {
                self.pending_since = None;
                self.attempts = 0;
                self.set_state(ConnectionState::Connected)
            }
            _ => Transition::Unchanged,
        }
    }

    fn fail(&mut self) -> Transition {
        self.pending_since = None;
        self.set_state(ConnectionState::Disconnected)
    }

    fn next_recovery(&mut self, delay: impl Fn(&RetryPolicy, u32) -> Duration) -> Recovery {
        if self.attempts >= self.policy.max_attempts {
            return Recovery::GiveUp;
        }
        let wait = delay(&self.policy, self.attempts);
        self.attempts += 1;
        Recovery::RetryAfter(wait)
    }

    fn set_state(&mut self, next: ConnectionState) -> Transition {
        let previous = self.state;
        self.state = next;
        match (previous == ConnectionState::Connected, next == ConnectionState::Connected) {
            (false, true) => Transition::BecameConnected,
            (true, false) => Transition::BecameDisconnected,
            _ => Transition::Unchanged,
        }
    }
}
