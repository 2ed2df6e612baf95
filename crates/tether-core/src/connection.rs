//! Connection state machine for the relay channel.
//!
//! This module implements the session layer of one duplex channel to the
//! relay: lifecycle, connect timeout, heartbeat, and reconnect backoff.
//!
//! # Architecture: Action-Based State Machine
//!
//! The state machine follows the action pattern:
//! - Methods accept time as parameter (no stored Environment)
//! - Methods return `Vec<ConnectionAction>`
//! - Driver code executes actions (dial, send frames, close the channel)
//!
//! This enables pure state machine logic with no I/O and easy testing
//! without mocking time.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect ┌────────────┐  opened   ┌───────────┐
//! │ Disconnected │────────>│ Connecting │──────────>│ Connected │
//! └──────────────┘         └────────────┘           └───────────┘
//!        ▲                     ▲    │ timeout/            │ closed
//!        │                     │    │ closed              ▼
//!        │ closed          retry│    ▼              ┌──────────────┐
//!        │                 ┌────┴─────────┐<───────│ Disconnected │
//!        └─────────────────│ Reconnecting │        └──────────────┘
//!                          └──────────────┘
//!                                 │ attempts exhausted / channel error
//!                                 ▼
//!                             ┌────────┐
//!                             │ Failed │  (terminal unless reset)
//!                             └────────┘
//! ```
//!
//! All transitions funnel through one state-setting routine that is a
//! no-op when the target state equals the current state, so listeners
//! never observe two consecutive identical notifications.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tether_proto::{ProtocolError, WireMessage};

use crate::error::ConnectionError;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel. Initial state.
    Disconnected,
    /// Dial in progress, connect timeout armed.
    Connecting,
    /// Channel open, heartbeat running.
    Connected,
    /// Waiting out the backoff delay before the next dial.
    Reconnecting,
    /// Terminal until explicitly reset.
    Failed,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a dial may stay in `Connecting` before it is aborted.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings while `Connected`.
    pub heartbeat_interval: Duration,
    /// Base reconnect delay, doubled per attempt.
    pub base_reconnect_delay: Duration,
    /// Upper bound on the computed reconnect delay (before jitter).
    pub max_reconnect_delay: Duration,
    /// Maximum reconnect attempts; `None` means unbounded.
    pub max_reconnect_attempts: Option<u32>,
    /// Upper bound on the random jitter added to each reconnect delay.
    pub reconnect_jitter: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            reconnect_jitter: Duration::from_secs(1),
        }
    }
}

/// Actions returned by the connection state machine.
///
/// The driver (runtime or test) executes these:
/// - `Dial`: open the duplex channel to the relay
/// - `SendFrame`: write the frame to the open channel
/// - `CloseChannel`: tear down the physical channel; any state change
///   has already happened inside the machine
/// - `NotifyState`: fan out a state-change notification to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open the duplex channel.
    Dial,
    /// Write this frame to the open channel.
    SendFrame(WireMessage),
    /// Tear down the physical channel.
    CloseChannel {
        /// Why the channel is being closed.
        reason: String,
    },
    /// Fan out a state change to listeners.
    NotifyState {
        /// The state just entered.
        state: ConnectionState,
        /// The error that caused the transition, if any.
        error: Option<ConnectionError>,
    },
}

/// Connection state machine.
///
/// Owns the lifecycle of at most one live channel at a time. Frames
/// submitted while not connected are buffered in memory and flushed FIFO
/// on the next successful open; durable queueing of application
/// envelopes is the delivery coordinator's job, not this machine's.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    config: ConnectionConfig,
    reconnect_attempts: u32,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    next_heartbeat_at: Option<Instant>,
    last_pong: Option<Instant>,
    pending: VecDeque<WireMessage>,
}

impl Connection {
    /// Create a new machine in `Disconnected`.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config,
            reconnect_attempts: 0,
            connect_deadline: None,
            reconnect_at: None,
            next_heartbeat_at: None,
            last_pong: None,
            pending: VecDeque::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Configuration this machine was built with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Number of frames buffered while disconnected.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Backoff delay (before jitter) for the current attempt count:
    /// `min(base * 2^attempts, max)`.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        let exp = self.reconnect_attempts.min(31);
        let base = self.config.base_reconnect_delay;
        let delay = base.checked_mul(1u32 << exp).unwrap_or(self.config.max_reconnect_delay);
        delay.min(self.config.max_reconnect_delay)
    }

    /// The earliest instant at which [`Connection::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.connect_deadline, self.reconnect_at, self.next_heartbeat_at, self.pong_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Begin a dial. No-op while already `Connecting` or `Connected`,
    /// and refused while `Failed` (the caller must [`Connection::reset`]
    /// first).
    pub fn connect_requested(&mut self, now: Instant) -> Vec<ConnectionAction> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Failed
        ) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.reconnect_at = None;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        self.set_state(ConnectionState::Connecting, None, &mut actions);
        actions.push(ConnectionAction::Dial);
        actions
    }

    /// The dial succeeded and the channel is open.
    ///
    /// Cancels the connect timer, resets the attempt counter, starts the
    /// heartbeat, and flushes frames buffered while disconnected, FIFO.
    pub fn channel_opened(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        self.last_pong = None;
        self.next_heartbeat_at = Some(now + self.config.heartbeat_interval);
        self.set_state(ConnectionState::Connected, None, &mut actions);

        while let Some(frame) = self.pending.pop_front() {
            actions.push(ConnectionAction::SendFrame(frame));
        }
        actions
    }

    /// The channel closed underneath us (not an explicit disconnect).
    ///
    /// Enters `Disconnected` and schedules a reconnect unless the state
    /// was already `Disconnected` or terminal.
    pub fn channel_closed(&mut self, now: Instant, jitter: Duration) -> Vec<ConnectionAction> {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.clear_timers();
        self.set_state(ConnectionState::Disconnected, None, &mut actions);
        self.schedule_reconnect(now, jitter, &mut actions);
        actions
    }

    /// The channel reported a fatal error. Enters `Failed`; the runtime
    /// rejects any in-flight connect call.
    pub fn channel_error(&mut self, error: ConnectionError) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.clear_timers();
        self.set_state(ConnectionState::Failed, Some(error), &mut actions);
        actions
    }

    /// Explicit, user-initiated disconnect. No reconnect is scheduled and
    /// the in-memory buffer is dropped.
    pub fn disconnect_requested(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.clear_timers();
        self.pending.clear();
        self.reconnect_attempts = 0;
        if self.state != ConnectionState::Disconnected {
            actions.push(ConnectionAction::CloseChannel { reason: "client disconnect".to_string() });
        }
        self.set_state(ConnectionState::Disconnected, None, &mut actions);
        actions
    }

    /// Leave the terminal `Failed` state and allow connecting again.
    pub fn reset(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Failed {
            self.reconnect_attempts = 0;
            self.set_state(ConnectionState::Disconnected, None, &mut actions);
        }
        actions
    }

    /// Submit a frame for transmission.
    ///
    /// Written immediately while connected, otherwise buffered in memory
    /// for the next successful open.
    pub fn send(&mut self, frame: WireMessage) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Connected {
            vec![ConnectionAction::SendFrame(frame)]
        } else {
            self.pending.push_back(frame);
            Vec::new()
        }
    }

    /// Process one inbound frame.
    ///
    /// Pongs are intercepted here and never reach message consumers;
    /// a record type that only travels client-to-relay is refused;
    /// everything else is handed back for dispatch.
    pub fn frame_received(
        &mut self,
        frame: WireMessage,
        now: Instant,
    ) -> Result<Option<WireMessage>, ProtocolError> {
        if frame.is_server_bound() {
            return Err(ProtocolError::UnexpectedRecord(frame.record_type()));
        }
        match frame {
            WireMessage::Pong { .. } => {
                self.last_pong = Some(now);
                Ok(None)
            },
            other => Ok(Some(other)),
        }
    }

    /// Advance timers: connect timeout, reconnect backoff, heartbeat,
    /// and the missing-pong watchdog.
    ///
    /// `unix_ms` stamps outgoing pings; `jitter` is applied if this tick
    /// ends up scheduling a reconnect.
    pub fn tick(&mut self, now: Instant, unix_ms: u64, jitter: Duration) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        // Connect timeout: abort the attempt, then back off.
        if self.state == ConnectionState::Connecting
            && self.connect_deadline.is_some_and(|d| now >= d)
        {
            self.connect_deadline = None;
            actions
                .push(ConnectionAction::CloseChannel { reason: "connect timeout".to_string() });
            self.set_state(ConnectionState::Disconnected, None, &mut actions);
            self.schedule_reconnect(now, jitter, &mut actions);
            return actions;
        }

        // Backoff elapsed: count the attempt and dial again.
        if self.state == ConnectionState::Reconnecting && self.reconnect_at.is_some_and(|d| now >= d)
        {
            self.reconnect_at = None;
            self.reconnect_attempts += 1;
            self.connect_deadline = Some(now + self.config.connect_timeout);
            self.set_state(ConnectionState::Connecting, None, &mut actions);
            actions.push(ConnectionAction::Dial);
            return actions;
        }

        if self.state == ConnectionState::Connected {
            // Missing-pong watchdog: force-close; the close handler above
            // will observe the drop and schedule the reconnect.
            if self.pong_deadline().is_some_and(|d| now >= d) {
                actions.push(ConnectionAction::CloseChannel {
                    reason: "heartbeat timeout".to_string(),
                });
                self.clear_timers();
                self.set_state(ConnectionState::Disconnected, None, &mut actions);
                self.schedule_reconnect(now, jitter, &mut actions);
                return actions;
            }

            if self.next_heartbeat_at.is_some_and(|d| now >= d) {
                self.next_heartbeat_at = Some(now + self.config.heartbeat_interval);
                actions.push(ConnectionAction::SendFrame(WireMessage::Ping {
                    timestamp: unix_ms,
                }));
            }
        }

        actions
    }

    /// No pong within twice the heartbeat interval is fatal for the
    /// channel. The watchdog only arms once a first pong has been seen,
    /// mirroring relays that answer the first ping late during warmup.
    fn pong_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.last_pong.map(|p| p + self.config.heartbeat_interval * 2)
    }

    fn schedule_reconnect(
        &mut self,
        now: Instant,
        jitter: Duration,
        actions: &mut Vec<ConnectionAction>,
    ) {
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                self.set_state(
                    ConnectionState::Failed,
                    Some(ConnectionError::RetriesExhausted { attempts: self.reconnect_attempts }),
                    actions,
                );
                return;
            }
        }

        let jitter = jitter.min(self.config.reconnect_jitter);
        self.reconnect_at = Some(now + self.reconnect_delay() + jitter);
        self.set_state(ConnectionState::Reconnecting, None, actions);
    }

    fn clear_timers(&mut self) {
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.next_heartbeat_at = None;
        self.last_pong = None;
    }

    /// Idempotent transition guard: entering the current state again
    /// produces no notification.
    fn set_state(
        &mut self,
        state: ConnectionState,
        error: Option<ConnectionError>,
        actions: &mut Vec<ConnectionAction>,
    ) {
        if self.state == state {
            return;
        }
        self.state = state;
        actions.push(ConnectionAction::NotifyState { state, error });
    }
}


#[cfg(test)]
mod backoff_props {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        // Delay is non-decreasing in the attempt count and never exceeds
        // the configured maximum.
        #[test]
        fn backoff_monotone(attempts in 0u32..64) {
            let mut conn = Connection::new(ConnectionConfig::default());
            let mut prev = Duration::ZERO;
            for _ in 0..attempts {
                let d = conn.reconnect_delay();
                prop_assert!(d >= prev);
                prop_assert!(d <= Duration::from_secs(30));
                prev = d;
                conn.reconnect_attempts += 1;
            }
        }
    }
}
