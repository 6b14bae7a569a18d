//! Wire protocol.
//!
//! Every message is a named event with a JSON payload:
//! `{ "event": "chunk:enter", "data": { "x": 2, "y": 3 } }`.
//! Over a byte stream each envelope is framed as a big-endian `u32` length
//! followed by the JSON body.
//!
//! Typed views (`ClientMsg`, `ServerMsg`) exist for the events this layer
//! understands. Anything else passes through as a raw `Envelope`.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::ChunkPayload;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Event names.
pub mod events {
    pub const AUTH: &str = "auth";
    pub const AUTH_SUCCESS: &str = "auth:success";
    pub const AUTH_ERROR: &str = "auth:error";
    pub const CHUNK_ENTER: &str = "chunk:enter";
    pub const CHUNK_DATA: &str = "chunk:data";
    pub const PLAYER_MOVE: &str = "player:move";
    pub const PLAYER_JOINED: &str = "player:joined";
    pub const PLAYER_LEFT: &str = "player:left";
    pub const PLAYER_MOVED: &str = "player:moved";
    pub const ENTITY_REMOVED: &str = "entity:removed";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Named event with an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Builds an envelope from a serialisable payload.
    pub fn from_payload<T: Serialize>(event: &str, payload: &T) -> Self {
        // Payload types in this module are plain structs; serialisation
        // cannot fail for them.
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(event, data)
    }

    /// Decodes the payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// Milliseconds since the Unix epoch, as carried by `ping`/`pong`.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Payloads ───

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub credential: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub player_id: String,
    /// Server-side player state; opaque to this layer.
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthError {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnter {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMove {
    pub x: f32,
    pub y: f32,
    pub chunk_x: i32,
    pub chunk_y: i32,
}

/// A remote player as announced by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: String,
    #[serde(default, alias = "name")]
    pub display_name: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default = "default_health")]
    pub health: f32,
    #[serde(default = "default_health")]
    pub max_health: f32,
}

fn default_health() -> f32 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMoved {
    pub id: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRemoved {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

// ─── Typed views ───

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Auth(AuthRequest),
    ChunkEnter(ChunkEnter),
    PlayerMove(PlayerMove),
    Ping(Ping),
    Other(Envelope),
}

impl ClientMsg {
    pub fn event_name(&self) -> &str {
        match self {
            ClientMsg::Auth(_) => events::AUTH,
            ClientMsg::ChunkEnter(_) => events::CHUNK_ENTER,
            ClientMsg::PlayerMove(_) => events::PLAYER_MOVE,
            ClientMsg::Ping(_) => events::PING,
            ClientMsg::Other(env) => &env.event,
        }
    }

    pub fn encode(&self) -> Envelope {
        match self {
            ClientMsg::Auth(p) => Envelope::from_payload(events::AUTH, p),
            ClientMsg::ChunkEnter(p) => Envelope::from_payload(events::CHUNK_ENTER, p),
            ClientMsg::PlayerMove(p) => Envelope::from_payload(events::PLAYER_MOVE, p),
            ClientMsg::Ping(p) => Envelope::from_payload(events::PING, p),
            ClientMsg::Other(env) => env.clone(),
        }
    }

    pub fn decode(env: Envelope) -> serde_json::Result<Self> {
        Ok(match env.event.as_str() {
            events::AUTH => ClientMsg::Auth(env.payload()?),
            events::CHUNK_ENTER => ClientMsg::ChunkEnter(env.payload()?),
            events::PLAYER_MOVE => ClientMsg::PlayerMove(env.payload()?),
            events::PING => ClientMsg::Ping(env.payload()?),
            _ => ClientMsg::Other(env),
        })
    }
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    AuthSuccess(AuthSuccess),
    AuthError(AuthError),
    ChunkData(ChunkPayload),
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerLeft),
    PlayerMoved(PlayerMoved),
    EntityRemoved(EntityRemoved),
    Pong(Pong),
    Other(Envelope),
}

impl ServerMsg {
    pub fn encode(&self) -> Envelope {
        match self {
            ServerMsg::AuthSuccess(p) => Envelope::from_payload(events::AUTH_SUCCESS, p),
            ServerMsg::AuthError(p) => Envelope::from_payload(events::AUTH_ERROR, p),
            ServerMsg::ChunkData(p) => Envelope::from_payload(events::CHUNK_DATA, p),
            ServerMsg::PlayerJoined(p) => Envelope::from_payload(events::PLAYER_JOINED, p),
            ServerMsg::PlayerLeft(p) => Envelope::from_payload(events::PLAYER_LEFT, p),
            ServerMsg::PlayerMoved(p) => Envelope::from_payload(events::PLAYER_MOVED, p),
            ServerMsg::EntityRemoved(p) => Envelope::from_payload(events::ENTITY_REMOVED, p),
            ServerMsg::Pong(p) => Envelope::from_payload(events::PONG, p),
            ServerMsg::Other(env) => env.clone(),
        }
    }

    /// Decodes a server envelope.
    ///
    /// `chunk:data` never fails: missing or malformed parts decode as empty.
    pub fn decode(env: Envelope) -> serde_json::Result<Self> {
        Ok(match env.event.as_str() {
            events::AUTH_SUCCESS => ServerMsg::AuthSuccess(env.payload()?),
            events::AUTH_ERROR => ServerMsg::AuthError(env.payload().unwrap_or(AuthError {
                message: String::new(),
            })),
            events::CHUNK_DATA => ServerMsg::ChunkData(ChunkPayload::from_value(&env.data)),
            events::PLAYER_JOINED => ServerMsg::PlayerJoined(env.payload()?),
            events::PLAYER_LEFT => ServerMsg::PlayerLeft(env.payload()?),
            events::PLAYER_MOVED => ServerMsg::PlayerMoved(env.payload()?),
            events::ENTITY_REMOVED => ServerMsg::EntityRemoved(env.payload()?),
            events::PONG => ServerMsg::Pong(env.payload()?),
            _ => ServerMsg::Other(env),
        })
    }
}

// ─── Framing ───

/// Encodes one length-prefixed frame.
pub fn encode_frame(env: &Envelope) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(env).context("serialize envelope")?;
    anyhow::ensure!(payload.len() <= MAX_FRAME_LEN, "frame too large: {}", payload.len());
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, env: &Envelope) -> anyhow::Result<()> {
    let frame = encode_frame(env)?;
    w.write_all(&frame).await.context("tcp write")?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Envelope> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame too large: {len}");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    serde_json::from_slice(&payload).context("deserialize envelope")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_success_uses_camel_case() {
        let env = Envelope::new(
            events::AUTH_SUCCESS,
            json!({ "playerId": "p-1", "state": { "credits": 5 } }),
        );
        match ServerMsg::decode(env).unwrap() {
            ServerMsg::AuthSuccess(ok) => {
                assert_eq!(ok.player_id, "p-1");
                assert_eq!(ok.state["credits"], 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn player_move_wire_shape() {
        let env = ClientMsg::PlayerMove(PlayerMove {
            x: 1.5,
            y: -2.0,
            chunk_x: 0,
            chunk_y: -1,
        })
        .encode();
        assert_eq!(env.event, "player:move");
        assert_eq!(env.data, json!({ "x": 1.5, "y": -2.0, "chunkX": 0, "chunkY": -1 }));
    }

    #[test]
    fn unknown_event_passes_through() {
        let env = Envelope::new("trade:offer", json!({ "item": "ore" }));
        assert_eq!(
            ServerMsg::decode(env.clone()).unwrap(),
            ServerMsg::Other(env)
        );
    }

    #[test]
    fn player_info_accepts_name_alias() {
        let info: PlayerInfo =
            serde_json::from_value(json!({ "id": "p2", "name": "Vega", "x": 3.0 })).unwrap();
        assert_eq!(info.display_name, "Vega");
        assert_eq!(info.max_health, 100.0);
    }

    #[tokio::test]
    async fn frames_survive_a_byte_stream() -> anyhow::Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = ClientMsg::ChunkEnter(ChunkEnter { x: 2, y: 3 }).encode();
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move { write_frame(&mut a, &sent).await })
        };
        let got = read_frame(&mut b).await?;
        writer.await??;
        assert_eq!(got, sent);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
