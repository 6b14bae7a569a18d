//! Server implementation.
//!
//! `WorldHandle` is the shared entry point to a `WorldServer`: connections
//! attach with an outbound channel, deliver inbound envelopes, and detach.
//! Replies are routed to each connection's channel under the same lock, so
//! per-connection ordering matches the order the world produced them.
//!
//! `SyncServer` serves the world over TCP using the length-prefixed JSON
//! framing from `sync_shared::net`.

use anyhow::Context;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
};
use sync_shared::{
    math::Vec2,
    net::{read_frame, write_frame, Envelope},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::world::{ConnId, Outbound, WorldConfig, WorldServer, WorldStats};

struct Hub {
    world: WorldServer,
    links: HashMap<ConnId, mpsc::UnboundedSender<Envelope>>,
    accepting: bool,
}

impl Hub {
    fn route(&mut self, out: Vec<Outbound>) {
        for Outbound { to, envelope } in out {
            match self.links.get(&to) {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => debug!(conn = to, event = %envelope.event, "Dropping envelope for closed connection"),
            }
        }
    }
}

/// Cloneable handle to a shared world.
#[derive(Clone)]
pub struct WorldHandle {
    inner: Arc<Mutex<Hub>>,
}

impl WorldHandle {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Hub {
                world: WorldServer::new(config),
                links: HashMap::new(),
                accepting: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection. `None` while the world refuses connections.
    pub fn attach(&self, tx: mpsc::UnboundedSender<Envelope>) -> Option<ConnId> {
        let mut hub = self.lock();
        if !hub.accepting {
            return None;
        }
        let conn = hub.world.connect();
        hub.links.insert(conn, tx);
        Some(conn)
    }

    pub fn deliver(&self, conn: ConnId, envelope: Envelope) {
        let mut hub = self.lock();
        let out = hub.world.handle(conn, envelope);
        hub.route(out);
    }

    /// Removes a connection after the peer went away. Idempotent.
    pub fn detach(&self, conn: ConnId) {
        let mut hub = self.lock();
        hub.links.remove(&conn);
        let out = hub.world.disconnect(conn);
        hub.route(out);
    }

    /// Closes a connection from the server side. The peer observes its
    /// stream ending.
    pub fn drop_connection(&self, conn: ConnId) -> bool {
        let existed = self.lock().links.contains_key(&conn);
        if existed {
            info!(conn, "Dropping connection");
            self.detach(conn);
        }
        existed
    }

    /// Closes whichever connection is bound to `player_id`.
    pub fn drop_player(&self, player_id: &str) -> bool {
        let conn = self.lock().world.player_conn(player_id);
        match conn {
            Some(conn) => self.drop_connection(conn),
            None => false,
        }
    }

    /// Closes every connection.
    pub fn drop_all(&self) -> usize {
        let conns: Vec<ConnId> = self.lock().links.keys().copied().collect();
        conns.into_iter().filter(|c| self.drop_connection(*c)).count()
    }

    /// While false, new connections are refused.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn stats(&self) -> WorldStats {
        self.lock().world.stats()
    }

    pub fn player_position(&self, player_id: &str) -> Option<Vec2> {
        self.lock().world.player_position(player_id)
    }
}

/// TCP front end for a world.
pub struct SyncServer {
    listener: TcpListener,
    world: WorldHandle,
}

impl SyncServer {
    pub async fn bind(addr: &str, config: WorldConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = addr.parse().context("parse listen addr")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        Ok(Self {
            listener,
            world: WorldHandle::new(config),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    pub fn world(&self) -> WorldHandle {
        self.world.clone()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await.context("accept")?;
            let world = self.world.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, world).await {
                    debug!(%peer, error = %format!("{e:#}"), "Connection ended");
                }
            });
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, world: WorldHandle) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let Some(conn) = world.attach(tx) else {
        warn!(%peer, "Refusing connection");
        return Ok(());
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    info!(%peer, conn, "Client connected");

    // Ends once the world drops this connection's link.
    let mut writer_task = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            write_frame(&mut writer, &env).await?;
        }
        anyhow::Ok(())
    });

    let result = loop {
        tokio::select! {
            inbound = read_frame(&mut reader) => match inbound {
                Ok(env) => world.deliver(conn, env),
                Err(e) => break Err(e),
            },
            written = &mut writer_task => break match written {
                Ok(r) => r,
                Err(e) => Err(e.into()),
            },
        }
    };
    writer_task.abort();
    world.detach(conn);
    info!(%peer, conn, "Client disconnected");
    result
}

/// Binds a server on an ephemeral localhost port.
pub async fn bind_ephemeral(config: WorldConfig) -> anyhow::Result<(SyncServer, SocketAddr)> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let server = SyncServer::bind(&addr.to_string(), config).await?;
    let local = server.local_addr()?;
    Ok((server, local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::net::{events, AuthRequest, ClientMsg};

    #[test]
    fn refused_while_not_accepting() {
        let world = WorldHandle::new(WorldConfig::default());
        world.set_accepting(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(world.attach(tx).is_none());
        world.set_accepting(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(world.attach(tx).is_some());
    }

    #[test]
    fn dropping_a_player_closes_its_link() {
        let world = WorldHandle::new(WorldConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = world.attach(tx).unwrap();
        world.deliver(
            conn,
            ClientMsg::Auth(AuthRequest {
                credential: "tok".into(),
                name: None,
            })
            .encode(),
        );
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.event, events::AUTH_SUCCESS);
        let player: sync_shared::net::AuthSuccess = reply.payload().unwrap();

        assert!(world.drop_player(&player.player_id));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        assert!(!world.drop_connection(conn));
        assert_eq!(world.stats().online_players, 0);
    }
}
