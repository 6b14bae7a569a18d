//! In-process transport.
//!
//! `LocalTransport` talks to a `WorldHandle` directly, without sockets. It
//! behaves like `TcpTransport` from the client's side: `Connected` arrives as
//! an event, server-side drops surface as `Disconnected`, and a world that
//! refuses connections produces `Error`. Used by the load test harness and by
//! end-to-end tests running on paused time.

use anyhow::Context;
use async_trait::async_trait;
use sync_shared::{
    net::Envelope,
    transport::{recv_or_park, Transport, TransportEvent},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{server::WorldHandle, world::ConnId};

pub struct LocalTransport {
    world: WorldHandle,
    conn: Option<ConnId>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl LocalTransport {
    pub fn new(world: WorldHandle) -> Self {
        Self {
            world,
            conn: None,
            events: None,
            pump: None,
        }
    }

    /// Connection id on the world side, while connected.
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn connect(&mut self) {
        self.disconnect();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.events = Some(event_rx);

        let (link_tx, mut link_rx) = mpsc::unbounded_channel::<Envelope>();
        let Some(conn) = self.world.attach(link_tx) else {
            let _ = event_tx.send(TransportEvent::Error {
                message: "connection refused".into(),
            });
            return;
        };
        self.conn = Some(conn);
        let _ = event_tx.send(TransportEvent::Connected);
        self.pump = Some(tokio::spawn(async move {
            while let Some(env) = link_rx.recv().await {
                if event_tx.send(TransportEvent::Message(env)).is_err() {
                    return;
                }
            }
            debug!(conn, "Local link closed by server");
            let _ = event_tx.send(TransportEvent::Disconnected {
                reason: "server closed connection".into(),
            });
        }));
    }

    fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(conn) = self.conn.take() {
            self.world.detach(conn);
        }
        self.events = None;
    }

    fn send(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        let conn = self.conn.context("not connected")?;
        self.world.deliver(conn, envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        recv_or_park(&mut self.events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldConfig;
    use serde_json::json;
    use sync_shared::net::{events, Pong};

    #[tokio::test]
    async fn exchanges_envelopes_with_the_world() {
        let world = WorldHandle::new(WorldConfig::default());
        let mut transport = LocalTransport::new(world.clone());
        transport.connect();
        assert_eq!(transport.recv().await, Some(TransportEvent::Connected));

        transport
            .send(Envelope::new(events::PING, json!({ "timestamp": 9 })))
            .unwrap();
        match transport.recv().await {
            Some(TransportEvent::Message(env)) => {
                assert_eq!(env.payload::<Pong>().unwrap().timestamp, 9)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(world.stats().connections, 1);
        transport.disconnect();
        assert_eq!(world.stats().connections, 0);
        assert!(transport.send(Envelope::new(events::PING, json!({}))).is_err());
    }

    #[tokio::test]
    async fn server_drop_reports_disconnect() {
        let world = WorldHandle::new(WorldConfig::default());
        let mut transport = LocalTransport::new(world.clone());
        transport.connect();
        assert_eq!(transport.recv().await, Some(TransportEvent::Connected));
        assert_eq!(world.drop_all(), 1);
        assert!(matches!(
            transport.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn refused_connection_reports_error() {
        let world = WorldHandle::new(WorldConfig::default());
        world.set_accepting(false);
        let mut transport = LocalTransport::new(world);
        transport.connect();
        assert!(matches!(transport.recv().await, Some(TransportEvent::Error { .. })));
    }
}
