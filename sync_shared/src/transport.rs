//! Transport contract.
//!
//! A transport is an opaque bidirectional event channel: it can be told to
//! connect/disconnect, it accepts outbound envelopes, and it reports
//! `Connected`, `Disconnected`, `Error` and inbound messages as
//! `TransportEvent`s.
//!
//! `connect()` and `disconnect()` never block; outcomes arrive as events.
//! Each connection owns a fresh event channel, so after `disconnect()` or a
//! new `connect()` no event from the previous connection is ever observed.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::net::{read_frame, write_frame, Envelope};

/// Lifecycle and message events produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    Message(Envelope),
}

#[async_trait]
pub trait Transport: Send {
    /// Starts a connection attempt, replacing any existing connection.
    fn connect(&mut self);

    /// Drops the current connection. No `Disconnected` event is produced.
    fn disconnect(&mut self);

    /// Queues an envelope on the current connection.
    fn send(&mut self, envelope: Envelope) -> anyhow::Result<()>;

    /// Next event of the current connection. Pending while there is none.
    async fn recv(&mut self) -> Option<TransportEvent>;
}

/// Receives from an optional channel, parking forever once it is gone.
pub async fn recv_or_park(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    if let Some(inner) = rx.as_mut() {
        if let Some(ev) = inner.recv().await {
            return Some(ev);
        }
        *rx = None;
    }
    std::future::pending().await
}

// ─── TCP ───

/// Length-prefixed JSON framing over TCP.
pub struct TcpTransport {
    addr: String,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            events: None,
            outbound: None,
            task: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn connect(&mut self) {
        self.disconnect();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.events = Some(event_rx);
        self.outbound = Some(out_tx);
        self.task = Some(tokio::spawn(connection_task(
            self.addr.clone(),
            event_tx,
            out_rx,
        )));
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.events = None;
    }

    fn send(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        self.outbound
            .as_ref()
            .context("not connected")?
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        recv_or_park(&mut self.events).await
    }
}

async fn connection_task(
    addr: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%addr, error = %e, "TCP connect failed");
            let _ = events.send(TransportEvent::Error {
                message: format!("connect {addr}: {e}"),
            });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    if events.send(TransportEvent::Connected).is_err() {
        return;
    }

    // Frame reads are not cancel-safe, so writes run on their own task. It
    // ends once the outbound sender is dropped by `disconnect()`.
    let mut writer_task = tokio::spawn(async move {
        while let Some(env) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &env).await {
                return Some(format!("{e:#}"));
            }
        }
        None
    });

    let reason = loop {
        tokio::select! {
            inbound = read_frame(&mut reader) => match inbound {
                Ok(env) => {
                    if events.send(TransportEvent::Message(env)).is_err() {
                        return;
                    }
                }
                Err(e) => break format!("{e:#}"),
            },
            written = &mut writer_task => match written {
                Ok(Some(reason)) => break reason,
                _ => return,
            },
        }
    };
    warn!(%addr, %reason, "TCP connection lost");
    let _ = events.send(TransportEvent::Disconnected { reason });
}

// ─── Recording ───

/// What a `RecordingTransport` has been asked to do.
#[derive(Debug, Default)]
pub struct TransportLog {
    pub connects: usize,
    pub disconnects: usize,
    pub sent: Vec<Envelope>,
}

impl TransportLog {
    /// Sent envelopes with the given event name.
    pub fn sent_named(&self, event: &str) -> Vec<Envelope> {
        self.sent.iter().filter(|e| e.event == event).cloned().collect()
    }
}

/// A transport that records calls and replays scripted events, useful for
/// headless tests of the state machines.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
    scripted: Arc<Mutex<VecDeque<TransportEvent>>>,
    connected: Arc<Mutex<bool>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recorded calls.
    pub fn log(&self) -> std::sync::MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues an event for `recv()`.
    pub fn script(&self, ev: TransportEvent) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ev);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn connect(&mut self) {
        self.log().connects += 1;
        *self.connected.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    fn disconnect(&mut self) {
        self.log().disconnects += 1;
        *self.connected.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    fn send(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        self.log().sent.push(envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        let next = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(ev) => Some(ev),
            None => std::future::pending().await,
        }
    }
}
