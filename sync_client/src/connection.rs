//! Connection manager.
//!
//! Owns the transport and the session lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticating -> Authenticated
//!        any live state -> Reconnecting -> Connecting -> ...
//!        any state -> Closed   (explicit disconnect only)
//! ```
//!
//! The manager is a pure state machine. It never sleeps: every wait (backoff,
//! connect watchdog, heartbeat cadence, pong deadline) is a deadline reported
//! by `next_timeout()` and fired by `handle_timeout(now)`. Callers feed
//! transport events in with `handle_transport_event` and drain the resulting
//! `ConnectionEvent`s.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use sync_shared::{
    chunk::PartitionKey,
    config::ConnectionConfig,
    event::EventQueue,
    net::{timestamp_ms, AuthRequest, AuthSuccess, ClientMsg, Envelope, Ping, ServerMsg},
    transport::{Transport, TransportEvent},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No transport session and no reconnect pending.
    Disconnected,
    /// Transport connect in progress (watchdog armed).
    Connecting,
    /// Transport up, auth not yet sent.
    Connected,
    /// Auth sent, waiting for `auth:success`.
    Authenticating,
    /// Ready; outbound messages go straight to the transport.
    Authenticated,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Terminal; reached only through `disconnect()`.
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting | Closed)
                | (Connecting, Connected | Reconnecting | Disconnected | Closed)
                | (Connected, Authenticating | Reconnecting | Disconnected | Closed)
                | (
                    Authenticating,
                    Authenticated | Connected | Reconnecting | Disconnected | Closed
                )
                | (Authenticated, Reconnecting | Disconnected | Closed)
                | (Reconnecting, Connecting | Disconnected | Closed)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("session is closed")]
    Closed,
    #[error("session snapshot already restored since the last disconnect")]
    SnapshotAlreadyRestored,
    #[error("no session snapshot to restore")]
    NoSnapshot,
    #[error("client task has stopped")]
    ClientGone,
}

/// Source of the bearer credential, consulted on every (re)connect.
pub trait CredentialProvider: Send {
    fn credential(&mut self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn credential(&mut self) -> Option<String> {
        self()
    }
}

/// A provider that always returns the same token.
pub fn static_credential(token: impl Into<String>) -> impl CredentialProvider {
    let token = token.into();
    move || Some(token.clone())
}

#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    /// Incremented on every successful transport connect.
    pub session_id: u64,
    pub credential: Option<String>,
    pub player_id: Option<String>,
    pub last_heartbeat_sent_at: Option<Instant>,
    pub last_heartbeat_ack_at: Option<Instant>,
}

/// A scheduled reconnect attempt waiting for its backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub attempt_number: u32,
    pub scheduled_delay: Duration,
    pub deadline: Instant,
}

/// Identity captured at an unintended disconnect, restored once after the
/// next successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub player_id: String,
    pub credential: Option<String>,
    pub current_partition_key: Option<PartitionKey>,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub event_name: String,
    pub payload: Value,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Every state transition, in order.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Authentication succeeded. `restored` carries the consumed snapshot.
    Authenticated {
        player_id: String,
        restored: Option<SessionSnapshot>,
        reconnected: bool,
    },
    /// `auth:error` outside a reconnect cycle.
    AuthRejected {
        message: String,
    },
    /// Unintended loss of the transport session.
    ConnectionLost {
        reason: String,
    },
    /// A backoff delay started for attempt `attempt`.
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Authenticated again after a loss. `latency` is measured from the loss.
    Reconnected {
        attempts: u32,
        latency: Duration,
    },
    /// Terminal failure: the reconnect loop gave up.
    ReconnectExhausted {
        attempts: u32,
    },
    /// No pong before the heartbeat deadline.
    HeartbeatTimeout,
    /// Round trip of a ping, in milliseconds.
    Pong {
        rtt_ms: i64,
    },
    /// Application message for other components.
    Message(ServerMsg),
    /// `disconnect()` completed.
    Closed,
}

/// Cumulative counters.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: SessionState,
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_attempts: u64,
    pub exhausted_cycles: u64,
    pub average_reconnect_ms: f64,
    pub heartbeat_failures: u64,
    pub last_rtt_ms: Option<i64>,
    pub uptime_ms: u64,
    pub pending_messages: usize,
    pub dropped_messages: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub double_restore_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_attempts: u64,
    successful_reconnects: u64,
    failed_attempts: u64,
    exhausted_cycles: u64,
    total_reconnect_time: Duration,
    heartbeat_failures: u64,
    last_rtt_ms: Option<i64>,
    dropped_messages: u64,
    messages_sent: u64,
    messages_received: u64,
    double_restore_attempts: u64,
}

/// An ongoing outage.
#[derive(Debug, Clone, Copy)]
struct ReconnectCycle {
    started_at: Instant,
    attempts: u32,
}

/// `min(base * 2^(attempt-1), max)` for 1-based `attempt`.
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    config
        .base_delay()
        .saturating_mul(1u32 << exp)
        .min(config.max_delay())
}

pub struct ConnectionManager<T: Transport> {
    config: ConnectionConfig,
    transport: T,
    credentials: Box<dyn CredentialProvider>,
    display_name: Option<String>,
    session: Session,

    cycle: Option<ReconnectCycle>,
    scheduled: Option<ReconnectAttempt>,
    snapshot: Option<SessionSnapshot>,
    restored_since_disconnect: bool,
    partition: Option<PartitionKey>,
    pending: VecDeque<PendingMessage>,

    watchdog: Option<Instant>,
    heartbeat_due: Option<Instant>,
    pong_deadline: Option<Instant>,
    connected_since: Option<Instant>,
    intentional: bool,

    counters: Counters,
    events: EventQueue<ConnectionEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Binds the transport. Nothing happens until `connect()`.
    pub fn new(
        config: ConnectionConfig,
        transport: T,
        credentials: impl CredentialProvider + 'static,
    ) -> Self {
        Self {
            config,
            transport,
            credentials: Box::new(credentials),
            display_name: None,
            session: Session {
                state: SessionState::Disconnected,
                session_id: 0,
                credential: None,
                player_id: None,
                last_heartbeat_sent_at: None,
                last_heartbeat_ack_at: None,
            },
            cycle: None,
            scheduled: None,
            snapshot: None,
            restored_since_disconnect: false,
            partition: None,
            pending: VecDeque::new(),
            watchdog: None,
            heartbeat_due: None,
            pong_deadline: None,
            connected_since: None,
            intentional: false,
            counters: Counters::default(),
            events: EventQueue::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    // ─── Accessors ───

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.state == SessionState::Authenticated
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pending_messages(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter()
    }

    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn scheduled_reconnect(&self) -> Option<&ReconnectAttempt> {
        self.scheduled.as_ref()
    }

    pub fn partition(&self) -> Option<PartitionKey> {
        self.partition
    }

    /// Records the partition the local player occupies, for snapshots.
    pub fn track_partition(&mut self, key: PartitionKey) {
        self.partition = Some(key);
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain()
    }

    pub fn stats(&self, now: Instant) -> ConnectionStats {
        let c = &self.counters;
        let average_reconnect_ms = if c.successful_reconnects == 0 {
            0.0
        } else {
            c.total_reconnect_time.as_secs_f64() * 1000.0 / c.successful_reconnects as f64
        };
        ConnectionStats {
            state: self.session.state,
            total_attempts: c.total_attempts,
            successful_reconnects: c.successful_reconnects,
            failed_attempts: c.failed_attempts,
            exhausted_cycles: c.exhausted_cycles,
            average_reconnect_ms,
            heartbeat_failures: c.heartbeat_failures,
            last_rtt_ms: c.last_rtt_ms,
            uptime_ms: self
                .connected_since
                .map_or(0, |t| now.saturating_duration_since(t).as_millis() as u64),
            pending_messages: self.pending.len(),
            dropped_messages: c.dropped_messages,
            messages_sent: c.messages_sent,
            messages_received: c.messages_received,
            double_restore_attempts: c.double_restore_attempts,
        }
    }

    /// Earliest pending deadline, if any timer is armed.
    pub fn next_timeout(&self) -> Option<Instant> {
        [
            self.scheduled.map(|s| s.deadline),
            self.watchdog,
            self.pong_deadline,
            self.heartbeat_due,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─── Lifecycle ───

    pub fn connect(&mut self, now: Instant) -> Result<(), ConnectionError> {
        match self.session.state {
            SessionState::Closed => Err(ConnectionError::Closed),
            SessionState::Disconnected => {
                self.intentional = false;
                info!("Connecting");
                self.transition(SessionState::Connecting);
                self.transport.connect();
                self.watchdog = Some(now + self.config.heartbeat_timeout());
                Ok(())
            }
            state => {
                debug!(?state, "connect() ignored, session already live");
                Ok(())
            }
        }
    }

    /// Explicit teardown. Suppresses reconnection and discards the session.
    pub fn disconnect(&mut self) {
        if self.session.state == SessionState::Closed {
            return;
        }
        info!("Disconnecting");
        self.intentional = true;
        self.transport.disconnect();
        self.cancel_timers();
        self.scheduled = None;
        self.cycle = None;
        self.snapshot = None;
        self.connected_since = None;
        self.session.player_id = None;
        if !self.pending.is_empty() {
            debug!(discarded = self.pending.len(), "Discarding pending messages");
            self.pending.clear();
        }
        self.transition(SessionState::Closed);
        self.events.push(ConnectionEvent::Closed);
    }

    /// Alias for `disconnect()`, for composition roots tearing down.
    pub fn destroy(&mut self) {
        self.disconnect();
    }

    /// Retries authentication on a connected but unauthenticated session.
    pub fn authenticate(&mut self, now: Instant) {
        if self.session.state == SessionState::Connected {
            self.begin_auth(now);
        }
    }

    /// Drops the transport as if the network failed. Used for fault injection.
    pub fn simulate_transport_drop(&mut self, reason: &str, now: Instant) {
        if matches!(
            self.session.state,
            SessionState::Closed | SessionState::Disconnected
        ) {
            return;
        }
        warn!(%reason, "Forcing transport drop");
        self.transport.disconnect();
        self.handle_connection_lost(reason.to_string(), now);
    }

    // ─── Outbound ───

    /// Sends now when authenticated, otherwise queues for replay.
    pub fn queue_or_send(&mut self, event: &str, payload: Value, now: Instant) {
        let env = Envelope::new(event, payload);
        if self.is_authenticated() {
            if let Err(e) = self.transport.send(env.clone()) {
                warn!(event = %env.event, error = %e, "Send failed, queueing");
                self.enqueue(env, now);
            } else {
                self.counters.messages_sent += 1;
            }
        } else {
            self.enqueue(env, now);
        }
    }

    pub fn send_msg(&mut self, msg: &ClientMsg, now: Instant) {
        let env = msg.encode();
        self.queue_or_send(&env.event, env.data, now);
    }

    fn enqueue(&mut self, env: Envelope, now: Instant) {
        let cap = self.config.max_pending_messages;
        if cap == 0 {
            self.counters.dropped_messages += 1;
            return;
        }
        while self.pending.len() >= cap {
            if let Some(old) = self.pending.pop_front() {
                self.counters.dropped_messages += 1;
                warn!(event = %old.event_name, cap, "Pending queue full, dropping oldest");
            }
        }
        self.pending.push_back(PendingMessage {
            event_name: env.event,
            payload: env.data,
            enqueued_at: now,
        });
    }

    fn send_direct(&mut self, msg: &ClientMsg) -> bool {
        match self.transport.send(msg.encode()) {
            Ok(()) => {
                self.counters.messages_sent += 1;
                true
            }
            Err(e) => {
                warn!(event = msg.event_name(), error = %e, "Direct send failed");
                false
            }
        }
    }

    fn drain_pending(&mut self) {
        let mut replayed = 0usize;
        while let Some(msg) = self.pending.pop_front() {
            let env = Envelope::new(msg.event_name.clone(), msg.payload.clone());
            if let Err(e) = self.transport.send(env) {
                warn!(error = %e, "Replay interrupted");
                self.pending.push_front(msg);
                break;
            }
            self.counters.messages_sent += 1;
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "Replayed pending messages");
        }
    }

    // ─── Inbound ───

    pub fn handle_transport_event(&mut self, ev: TransportEvent, now: Instant) {
        match ev {
            TransportEvent::Connected => self.on_transport_connected(now),
            TransportEvent::Disconnected { reason } => {
                info!(%reason, "Transport disconnected");
                self.handle_connection_lost(reason, now);
            }
            TransportEvent::Error { message } => {
                warn!(%message, "Transport error");
                self.handle_connection_lost(message, now);
            }
            TransportEvent::Message(env) => {
                self.counters.messages_received += 1;
                let event = env.event.clone();
                match ServerMsg::decode(env) {
                    Ok(msg) => self.on_server_msg(msg, now),
                    Err(e) => warn!(%event, error = %e, "Dropping malformed server message"),
                }
            }
        }
    }

    fn on_transport_connected(&mut self, now: Instant) {
        if self.session.state != SessionState::Connecting {
            debug!(state = ?self.session.state, "Ignoring stray connect event");
            return;
        }
        self.session.session_id += 1;
        info!(session_id = self.session.session_id, "Transport connected");
        self.transition(SessionState::Connected);
        self.begin_auth(now);
    }

    fn begin_auth(&mut self, now: Instant) {
        let credential = self
            .credentials
            .credential()
            .or_else(|| self.snapshot.as_ref().and_then(|s| s.credential.clone()))
            .or_else(|| self.session.credential.clone());
        let Some(credential) = credential else {
            warn!("No credential available for authentication");
            if self.cycle.is_some() {
                self.handle_connection_lost("no credential available".into(), now);
            } else {
                self.watchdog = None;
                self.events.push(ConnectionEvent::AuthRejected {
                    message: "no credential available".into(),
                });
            }
            return;
        };
        self.session.credential = Some(credential.clone());
        let msg = ClientMsg::Auth(AuthRequest {
            credential,
            name: self.display_name.clone(),
        });
        self.send_direct(&msg);
        self.transition(SessionState::Authenticating);
        self.watchdog = Some(now + self.config.heartbeat_timeout());
    }

    fn on_server_msg(&mut self, msg: ServerMsg, now: Instant) {
        match msg {
            ServerMsg::AuthSuccess(ok) => self.on_authenticated(ok, now),
            ServerMsg::AuthError(err) => self.on_auth_rejected(err.message, now),
            ServerMsg::Pong(pong) => {
                self.session.last_heartbeat_ack_at = Some(now);
                self.pong_deadline = None;
                let rtt_ms = (timestamp_ms() - pong.timestamp).max(0);
                self.counters.last_rtt_ms = Some(rtt_ms);
                self.events.push(ConnectionEvent::Pong { rtt_ms });
            }
            other => self.events.push(ConnectionEvent::Message(other)),
        }
    }

    fn on_authenticated(&mut self, ok: AuthSuccess, now: Instant) {
        match self.session.state {
            SessionState::Authenticating => {}
            SessionState::Authenticated => {
                warn!("Duplicate auth:success without an intervening disconnect");
                let _ = self.restore_snapshot();
                return;
            }
            state => {
                warn!(?state, "Ignoring auth:success outside authentication");
                return;
            }
        }

        let cycle = self.cycle.take();
        self.watchdog = None;
        self.transition(SessionState::Authenticated);
        self.session.player_id = Some(ok.player_id.clone());
        self.connected_since = Some(now);
        if self.config.heartbeat_enabled {
            self.heartbeat_due = Some(now + self.config.heartbeat_interval());
            self.pong_deadline = None;
        }

        let restored = if self.snapshot.is_some() {
            self.restore_snapshot().ok()
        } else {
            None
        };
        if let Some(snap) = &restored {
            if snap.player_id != ok.player_id {
                warn!(
                    preserved = %snap.player_id,
                    assigned = %ok.player_id,
                    "Server assigned a different player id after restore"
                );
            }
        }

        if let Some(cycle) = cycle {
            let latency = now.saturating_duration_since(cycle.started_at);
            self.counters.successful_reconnects += 1;
            self.counters.total_reconnect_time += latency;
            info!(
                attempts = cycle.attempts,
                latency_ms = latency.as_millis() as u64,
                "Reconnected"
            );
            self.events.push(ConnectionEvent::Reconnected {
                attempts: cycle.attempts,
                latency,
            });
        } else {
            info!(player_id = %ok.player_id, "Authenticated");
        }

        self.drain_pending();
        self.events.push(ConnectionEvent::Authenticated {
            player_id: ok.player_id,
            restored,
            reconnected: cycle.is_some(),
        });
    }

    fn on_auth_rejected(&mut self, message: String, now: Instant) {
        warn!(%message, "Authentication rejected");
        self.events.push(ConnectionEvent::AuthRejected {
            message: message.clone(),
        });
        if self.cycle.is_some() {
            self.handle_connection_lost(format!("auth rejected: {message}"), now);
        } else if self.session.state == SessionState::Authenticating {
            self.watchdog = None;
            self.transition(SessionState::Connected);
        }
    }

    /// Consumes the snapshot. A second call without an intervening
    /// disconnect is a bug and is reported as `SnapshotAlreadyRestored`.
    pub fn restore_snapshot(&mut self) -> Result<SessionSnapshot, ConnectionError> {
        if self.restored_since_disconnect && self.snapshot.is_none() {
            self.counters.double_restore_attempts += 1;
            error!("Session snapshot restored twice without an intervening disconnect");
            return Err(ConnectionError::SnapshotAlreadyRestored);
        }
        let snap = self.snapshot.take().ok_or(ConnectionError::NoSnapshot)?;
        self.restored_since_disconnect = true;
        if self.session.credential.is_none() {
            self.session.credential = snap.credential.clone();
        }
        if self.partition.is_none() {
            self.partition = snap.current_partition_key;
        }
        info!(player_id = %snap.player_id, partition = ?snap.current_partition_key, "Session restored");
        Ok(snap)
    }

    // ─── Loss and reconnection ───

    fn handle_connection_lost(&mut self, reason: String, now: Instant) {
        match self.session.state {
            SessionState::Closed | SessionState::Disconnected => {
                debug!(%reason, "Loss ignored, no live session");
                return;
            }
            _ if self.intentional => return,
            _ => {}
        }
        if self.scheduled.is_some() {
            debug!(%reason, "Reconnect already scheduled");
            return;
        }

        self.cancel_timers();
        self.connected_since = None;
        self.transport.disconnect();

        if self.cycle.is_some() {
            self.counters.failed_attempts += 1;
            warn!(%reason, "Reconnect attempt failed");
        } else {
            warn!(%reason, "Connection lost");
            self.restored_since_disconnect = false;
            self.capture_snapshot(now);
            self.events.push(ConnectionEvent::ConnectionLost { reason });
            if !self.config.auto_reconnect {
                self.transition(SessionState::Disconnected);
                return;
            }
            self.cycle = Some(ReconnectCycle {
                started_at: now,
                attempts: 0,
            });
        }
        self.schedule_next_attempt(now);
    }

    fn capture_snapshot(&mut self, now: Instant) {
        if !self.config.preserve_state || self.snapshot.is_some() {
            return;
        }
        let Some(player_id) = self.session.player_id.clone() else {
            return;
        };
        debug!(%player_id, partition = ?self.partition, "Captured session snapshot");
        self.snapshot = Some(SessionSnapshot {
            player_id,
            credential: self.session.credential.clone(),
            current_partition_key: self.partition,
            captured_at: now,
        });
    }

    fn schedule_next_attempt(&mut self, now: Instant) {
        let Some(cycle) = self.cycle else {
            return;
        };
        let attempt = cycle.attempts + 1;
        if attempt > self.config.max_reconnect_attempts {
            self.cycle = None;
            self.counters.exhausted_cycles += 1;
            error!(attempts = cycle.attempts, "Reconnection attempts exhausted");
            self.transition(SessionState::Disconnected);
            self.events.push(ConnectionEvent::ReconnectExhausted {
                attempts: cycle.attempts,
            });
            return;
        }
        let delay = backoff_delay(&self.config, attempt);
        self.scheduled = Some(ReconnectAttempt {
            attempt_number: attempt,
            scheduled_delay: delay,
            deadline: now + delay,
        });
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.transition(SessionState::Reconnecting);
        self.events
            .push(ConnectionEvent::ReconnectScheduled { attempt, delay });
    }

    fn start_attempt(&mut self, now: Instant) {
        let Some(attempt) = self.scheduled.take() else {
            return;
        };
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.attempts = attempt.attempt_number;
        }
        self.counters.total_attempts += 1;
        info!(attempt = attempt.attempt_number, "Reconnect attempt");
        self.transition(SessionState::Connecting);
        self.transport.connect();
        self.watchdog = Some(now + self.config.heartbeat_timeout());
    }

    // ─── Timers ───

    /// Fires every deadline that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.scheduled.is_some_and(|s| s.deadline <= now) {
            self.start_attempt(now);
        }

        if self.watchdog.is_some_and(|d| d <= now) {
            self.watchdog = None;
            warn!(state = ?self.session.state, "Connect watchdog expired");
            self.handle_connection_lost("connect timed out".into(), now);
        }

        if self.pong_deadline.is_some_and(|d| d <= now) {
            self.pong_deadline = None;
            self.counters.heartbeat_failures += 1;
            warn!("Heartbeat timed out");
            self.events.push(ConnectionEvent::HeartbeatTimeout);
            self.handle_connection_lost("heartbeat timeout".into(), now);
        }

        if let Some(due) = self.heartbeat_due.filter(|d| *d <= now) {
            let interval = self.config.heartbeat_interval();
            let mut next = due + interval;
            while next <= now {
                next += interval;
            }
            self.heartbeat_due = Some(next);
            self.send_direct(&ClientMsg::Ping(Ping {
                timestamp: timestamp_ms(),
            }));
            self.session.last_heartbeat_sent_at = Some(now);
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + self.config.heartbeat_timeout());
            }
        }
    }

    fn cancel_timers(&mut self) {
        self.watchdog = None;
        self.heartbeat_due = None;
        self.pong_deadline = None;
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.session.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            error!(?from, ?to, "Invalid session transition");
            debug_assert!(false, "invalid session transition {from:?} -> {to:?}");
            return;
        }
        debug!(?from, ?to, "Session state");
        self.session.state = to;
        self.events.push(ConnectionEvent::StateChanged { from, to });
    }
}
