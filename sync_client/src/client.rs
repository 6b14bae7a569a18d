//! Client implementation.
//!
//! `GameClient` is a cheap, cloneable handle to a task that owns:
//! - The connection manager (transport, session, reconnection, heartbeat)
//! - The chunk stream manager (partitions, remote players, scene)
//!
//! The task is the only place either state machine is touched, so every
//! transport event, timer and command is handled serially. State changes are
//! published on a broadcast channel as `ClientEvent`s.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sync_shared::{
    chunk::PartitionKey, config::SyncConfig, math::Vec2, render::SceneSink, transport::Transport,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::{
    chunks::{ChunkEvent, ChunkManager, ChunkStats},
    connection::{
        ConnectionError, ConnectionEvent, ConnectionManager, ConnectionStats, CredentialProvider,
        SessionState,
    },
};

/// Render cadence for remote player interpolation.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Current time on the runtime clock, so paused test time applies.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connection(ConnectionEvent),
    Chunk(ChunkEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub connection: ConnectionStats,
    pub chunks: ChunkStats,
}

/// Point-in-time view of the session, as compared by the connection tester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionProbe {
    pub state: SessionState,
    pub authenticated: bool,
    pub player_id: Option<String>,
    pub partition: Option<PartitionKey>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Disconnect(oneshot::Sender<()>),
    MoveTo(Vec2),
    EnterPartition(PartitionKey),
    Send { event: String, payload: Value },
    Stats(oneshot::Sender<ClientStats>),
    Probe(oneshot::Sender<SessionProbe>),
    ForceDrop(String),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running client task.
#[derive(Clone)]
pub struct GameClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl GameClient {
    /// Spawns the client task. Nothing is sent until `connect()`.
    pub fn spawn<T: Transport + 'static>(
        config: &SyncConfig,
        transport: T,
        credentials: impl CredentialProvider + 'static,
        scene: impl SceneSink + 'static,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = Actor {
            conn: ConnectionManager::new(config.connection.clone(), transport, credentials)
                .with_display_name(config.player_name.clone()),
            chunks: ChunkManager::new(config.chunks.clone(), scene),
            events: events.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { commands, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.request(Command::Connect).await?
    }

    /// Explicit disconnect. The session is closed for good.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(Command::Disconnect).await
    }

    pub async fn move_to(&self, pos: Vec2) -> Result<(), ConnectionError> {
        self.post(Command::MoveTo(pos)).await
    }

    pub async fn enter_partition(&self, key: PartitionKey) -> Result<(), ConnectionError> {
        self.post(Command::EnterPartition(key)).await
    }

    /// Sends an application event, queueing it while the session is down.
    pub async fn send(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        self.post(Command::Send {
            event: event.to_string(),
            payload,
        })
        .await
    }

    pub async fn stats(&self) -> Result<ClientStats, ConnectionError> {
        self.request(Command::Stats).await
    }

    pub async fn probe(&self) -> Result<SessionProbe, ConnectionError> {
        self.request(Command::Probe).await
    }

    /// Drops the transport as if the network failed.
    pub async fn force_drop(&self, reason: &str) -> Result<(), ConnectionError> {
        self.post(Command::ForceDrop(reason.to_string())).await
    }

    /// Disconnects and stops the task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }

    async fn post(&self, cmd: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ConnectionError::ClientGone)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await?;
        rx.await.map_err(|_| ConnectionError::ClientGone)
    }
}

struct Actor<T: Transport> {
    conn: ConnectionManager<T>,
    chunks: ChunkManager,
    events: broadcast::Sender<ClientEvent>,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut frame = tokio::time::interval(FRAME_INTERVAL);
        frame.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_frame = now();

        loop {
            let deadline = self.conn.next_timeout();
            tokio::select! {
                ev = self.conn.transport_mut().recv() => {
                    if let Some(ev) = ev {
                        self.conn.handle_transport_event(ev, now());
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(ack)) => {
                        self.teardown();
                        let _ = ack.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.teardown();
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.conn.handle_timeout(now()),
                _ = frame.tick() => {
                    let t = now();
                    self.chunks.update(t.saturating_duration_since(last_frame));
                    last_frame = t;
                }
            }
            self.dispatch();
        }
        debug!("Client task stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        let t = now();
        match cmd {
            Command::Connect(reply) => {
                let _ = reply.send(self.conn.connect(t));
            }
            Command::Disconnect(reply) => {
                self.conn.disconnect();
                self.chunks.reset();
                let _ = reply.send(());
            }
            Command::MoveTo(pos) => {
                self.chunks.update_local_position(pos, t, &mut self.conn);
            }
            Command::EnterPartition(key) => self.chunks.enter_partition(key, t, &mut self.conn),
            Command::Send { event, payload } => self.conn.queue_or_send(&event, payload, t),
            Command::Stats(reply) => {
                let _ = reply.send(ClientStats {
                    connection: self.conn.stats(t),
                    chunks: self.chunks.stats(),
                });
            }
            Command::Probe(reply) => {
                let _ = reply.send(SessionProbe {
                    state: self.conn.state(),
                    authenticated: self.conn.is_authenticated(),
                    player_id: self.conn.session().player_id.clone(),
                    partition: self.chunks.current_partition(),
                });
            }
            Command::ForceDrop(reason) => self.conn.simulate_transport_drop(&reason, t),
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    /// Routes connection events into the chunk manager, then publishes all
    /// pending events.
    fn dispatch(&mut self) {
        for ev in self.conn.drain_events() {
            match &ev {
                ConnectionEvent::Authenticated {
                    player_id, restored, ..
                } => {
                    let key = restored.as_ref().and_then(|s| s.current_partition_key);
                    self.chunks.on_authenticated(player_id, key, now(), &mut self.conn);
                }
                ConnectionEvent::Message(msg) => {
                    if !self.chunks.handle_server_msg(msg) {
                        debug!(?msg, "Unhandled server message");
                    }
                }
                _ => {}
            }
            let _ = self.events.send(ClientEvent::Connection(ev));
        }
        for ev in self.chunks.drain_events() {
            let _ = self.events.send(ClientEvent::Chunk(ev));
        }
    }

    fn teardown(&mut self) {
        info!("Shutting down client");
        self.conn.destroy();
        self.chunks.reset();
        self.dispatch();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::{
        net::{events, AuthSuccess, ServerMsg},
        render::NullScene,
        transport::{RecordingTransport, TransportEvent},
    };

    use crate::connection::static_credential;

    fn spawn() -> (GameClient, RecordingTransport) {
        let transport = RecordingTransport::new();
        let client = GameClient::spawn(
            &SyncConfig::default(),
            transport.clone(),
            static_credential("t"),
            NullScene::default(),
        );
        (client, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_triggers_one_partition_request() {
        let (client, transport) = spawn();
        let mut events = client.subscribe();
        client.connect().await.unwrap();
        transport.script(TransportEvent::Connected);
        transport.script(TransportEvent::Message(
            ServerMsg::AuthSuccess(AuthSuccess {
                player_id: "p-1".into(),
                state: Value::Null,
            })
            .encode(),
        ));

        loop {
            if let ClientEvent::Connection(ConnectionEvent::Authenticated { .. }) =
                events.recv().await.unwrap()
            {
                break;
            }
        }
        let probe = client.probe().await.unwrap();
        assert!(probe.authenticated);
        assert_eq!(probe.player_id.as_deref(), Some("p-1"));
        assert_eq!(probe.partition, Some(PartitionKey::new(0, 0)));
        assert_eq!(transport.log().sent_named(events::CHUNK_ENTER).len(), 1);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_gone_after_shutdown() {
        let (client, _transport) = spawn();
        client.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.stats().await.err(), Some(ConnectionError::ClientGone));
        client.shutdown().await;
    }
}
