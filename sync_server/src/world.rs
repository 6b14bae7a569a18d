//! World state.
//!
//! An authoritative, IO-free world: it consumes client envelopes per
//! connection and returns the envelopes to deliver. The TCP listener and the
//! in-process transport both drive it through `WorldHandle`.
//!
//! Determinism notes:
//! - Chunk contents are generated from a per-chunk seed, so every request
//!   for the same key yields the same entities (minus collected ones).
//! - Player ids are derived from the credential, so a reconnecting client
//!   gets its identity and last position back.

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap, HashSet},
    hash::{Hash, Hasher},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sync_shared::{
    chunk::{ChunkPayload, EntityInfo, EntityKind, PartitionKey},
    math::Vec2,
    net::{
        AuthError, AuthRequest, AuthSuccess, ChunkEnter, ClientMsg, EntityRemoved, Envelope,
        PlayerInfo, PlayerLeft, PlayerMove, PlayerMoved, Pong, ServerMsg,
    },
};
use tracing::{debug, info, warn};

/// Client event that removes an entity from the world.
pub const ENTITY_COLLECT: &str = "entity:collect";

pub type ConnId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub chunk_size: f32,
    pub seed: u64,
    /// Multiplier on the per-kind entity counts.
    pub density: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000.0,
            seed: 0x5eed,
            density: 1.0,
        }
    }
}

/// An envelope addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnId,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorldStats {
    pub connections: usize,
    pub online_players: usize,
    pub known_players: usize,
    pub messages: u64,
    pub chunk_requests: u64,
    pub collected: usize,
}

struct PlayerState {
    name: String,
    position: Vec2,
    chunk: Option<PartitionKey>,
    conn: Option<ConnId>,
}

impl PlayerState {
    fn info(&self, id: &str) -> PlayerInfo {
        PlayerInfo {
            id: id.to_string(),
            display_name: self.name.clone(),
            x: self.position.x,
            y: self.position.y,
            health: 100.0,
            max_health: 100.0,
        }
    }
}

fn max_per_chunk(kind: EntityKind) -> u32 {
    match kind {
        EntityKind::Asteroid => 12,
        EntityKind::Crystal | EntityKind::Resource => 6,
        EntityKind::Npc => 4,
        EntityKind::Planet | EntityKind::Station => 1,
    }
}

pub struct WorldServer {
    config: WorldConfig,
    next_conn: ConnId,
    conns: BTreeMap<ConnId, Option<String>>,
    players: HashMap<String, PlayerState>,
    collected: HashSet<String>,
    messages: u64,
    chunk_requests: u64,
}

impl WorldServer {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            next_conn: 1,
            conns: BTreeMap::new(),
            players: HashMap::new(),
            collected: HashSet::new(),
            messages: 0,
            chunk_requests: 0,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            connections: self.conns.len(),
            online_players: self.players.values().filter(|p| p.conn.is_some()).count(),
            known_players: self.players.len(),
            messages: self.messages,
            chunk_requests: self.chunk_requests,
            collected: self.collected.len(),
        }
    }

    pub fn player_position(&self, id: &str) -> Option<Vec2> {
        self.players.get(id).map(|p| p.position)
    }

    /// Connection currently bound to a player.
    pub fn player_conn(&self, id: &str) -> Option<ConnId> {
        self.players.get(id).and_then(|p| p.conn)
    }

    pub fn connect(&mut self) -> ConnId {
        let id = self.next_conn;
        self.next_conn += 1;
        self.conns.insert(id, None);
        debug!(conn = id, "Connection opened");
        id
    }

    /// Forgets a connection and tells its chunk peers the player left.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(Some(player)) = self.conns.remove(&conn) {
            self.detach_player(&player, &mut out);
            info!(conn, %player, "Player offline");
        }
        out
    }

    pub fn handle(&mut self, conn: ConnId, env: Envelope) -> Vec<Outbound> {
        self.messages += 1;
        let mut out = Vec::new();
        if !self.conns.contains_key(&conn) {
            warn!(conn, "Message on unknown connection");
            return out;
        }
        if env.event == ENTITY_COLLECT {
            if let Ok(EntityRemoved { id }) = env.payload() {
                self.collect(conn, id, &mut out);
            }
            return out;
        }
        let event = env.event.clone();
        match ClientMsg::decode(env) {
            Ok(ClientMsg::Auth(req)) => self.auth(conn, req, &mut out),
            Ok(ClientMsg::ChunkEnter(ChunkEnter { x, y })) => {
                self.enter_chunk(conn, PartitionKey::new(x, y), &mut out)
            }
            Ok(ClientMsg::PlayerMove(mv)) => self.move_player(conn, mv, &mut out),
            Ok(ClientMsg::Ping(ping)) => out.push(Outbound {
                to: conn,
                envelope: ServerMsg::Pong(Pong {
                    timestamp: ping.timestamp,
                })
                .encode(),
            }),
            Ok(ClientMsg::Other(env)) => debug!(conn, event = %env.event, "Ignoring event"),
            Err(e) => warn!(conn, %event, error = %e, "Malformed client message"),
        }
        out
    }

    /// Deterministic contents of a chunk.
    pub fn generate_chunk(&self, key: PartitionKey) -> ChunkPayload {
        let mut hasher = DefaultHasher::new();
        (self.config.seed, key.x, key.y).hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let size = self.config.chunk_size;
        let origin = Vec2::new(key.x as f32 * size, key.y as f32 * size);
        let mut payload = ChunkPayload::new(key);
        for kind in EntityKind::ALL {
            let max = (max_per_chunk(kind) as f32 * self.config.density).round() as u32;
            let count = rng.gen_range(0..=max);
            let singular = kind.collection_name().trim_end_matches('s');
            let list: Vec<EntityInfo> = (0..count)
                .map(|i| EntityInfo {
                    id: format!("{singular}:{key}:{i}"),
                    x: origin.x + rng.gen_range(0.0..size),
                    y: origin.y + rng.gen_range(0.0..size),
                })
                .filter(|e| !self.collected.contains(&e.id))
                .collect();
            if !list.is_empty() {
                payload.entities.insert(kind, list);
            }
        }
        payload
    }

    fn player_of(&self, conn: ConnId) -> Option<String> {
        self.conns.get(&conn).cloned().flatten()
    }

    fn peers(&self, chunk: PartitionKey, except: &str) -> Vec<ConnId> {
        self.players
            .iter()
            .filter(|(id, p)| p.chunk == Some(chunk) && id.as_str() != except)
            .filter_map(|(_, p)| p.conn)
            .collect()
    }

    fn broadcast(&self, chunk: PartitionKey, except: &str, msg: ServerMsg, out: &mut Vec<Outbound>) {
        let envelope = msg.encode();
        for to in self.peers(chunk, except) {
            out.push(Outbound {
                to,
                envelope: envelope.clone(),
            });
        }
    }

    fn detach_player(&mut self, player: &str, out: &mut Vec<Outbound>) {
        let Some(state) = self.players.get_mut(player) else {
            return;
        };
        state.conn = None;
        if let Some(chunk) = state.chunk.take() {
            self.broadcast(
                chunk,
                player,
                ServerMsg::PlayerLeft(PlayerLeft { id: player.to_string() }),
                out,
            );
        }
    }

    fn auth(&mut self, conn: ConnId, req: AuthRequest, out: &mut Vec<Outbound>) {
        let credential = req.credential.trim();
        if credential.is_empty() {
            out.push(Outbound {
                to: conn,
                envelope: ServerMsg::AuthError(AuthError {
                    message: "missing credential".into(),
                })
                .encode(),
            });
            return;
        }
        let mut hasher = DefaultHasher::new();
        credential.hash(&mut hasher);
        let player_id = format!("p-{:016x}", hasher.finish());

        if let Some(old) = self.player_conn(&player_id).filter(|c| *c != conn) {
            info!(%player_id, old, new = conn, "Player took over from a stale connection");
            self.conns.insert(old, None);
            self.detach_player(&player_id, out);
        }

        let name = req.name.unwrap_or_else(|| player_id.clone());
        let state = self
            .players
            .entry(player_id.clone())
            .or_insert_with(|| PlayerState {
                name: name.clone(),
                position: Vec2::ZERO,
                chunk: None,
                conn: None,
            });
        state.name = name;
        state.conn = Some(conn);
        let position = state.position;
        let name = state.name.clone();
        self.conns.insert(conn, Some(player_id.clone()));

        info!(conn, %player_id, "Player authenticated");
        out.push(Outbound {
            to: conn,
            envelope: ServerMsg::AuthSuccess(AuthSuccess {
                player_id,
                state: json!({ "x": position.x, "y": position.y, "name": name }),
            })
            .encode(),
        });
    }

    fn enter_chunk(&mut self, conn: ConnId, key: PartitionKey, out: &mut Vec<Outbound>) {
        let Some(player) = self.player_of(conn) else {
            debug!(conn, "chunk:enter before auth");
            return;
        };
        self.chunk_requests += 1;
        let Some(state) = self.players.get_mut(&player) else {
            return;
        };
        let old = state.chunk.replace(key);
        let info = state.info(&player);
        if old != Some(key) {
            if let Some(old) = old {
                self.broadcast(old, &player, ServerMsg::PlayerLeft(PlayerLeft { id: player.clone() }), out);
            }
            self.broadcast(key, &player, ServerMsg::PlayerJoined(info), out);
        }

        let mut payload = self.generate_chunk(key);
        payload.players = self
            .players
            .iter()
            .filter(|(_, p)| p.conn.is_some() && p.chunk == Some(key))
            .map(|(id, p)| p.info(id))
            .collect();
        debug!(conn, %key, entities = payload.entity_count(), players = payload.players.len(), "Chunk served");
        out.push(Outbound {
            to: conn,
            envelope: ServerMsg::ChunkData(payload).encode(),
        });
    }

    fn move_player(&mut self, conn: ConnId, mv: PlayerMove, out: &mut Vec<Outbound>) {
        let Some(player) = self.player_of(conn) else {
            return;
        };
        let Some(state) = self.players.get_mut(&player) else {
            return;
        };
        state.position = Vec2::new(mv.x, mv.y);
        let Some(chunk) = state.chunk else {
            return;
        };
        self.broadcast(
            chunk,
            &player,
            ServerMsg::PlayerMoved(PlayerMoved {
                id: player.clone(),
                x: mv.x,
                y: mv.y,
            }),
            out,
        );
    }

    fn collect(&mut self, conn: ConnId, id: String, out: &mut Vec<Outbound>) {
        let Some(player) = self.player_of(conn) else {
            return;
        };
        let Some(chunk) = self.players.get(&player).and_then(|p| p.chunk) else {
            return;
        };
        if !self.collected.insert(id.clone()) {
            return;
        }
        let envelope = ServerMsg::EntityRemoved(EntityRemoved { id }).encode();
        out.push(Outbound {
            to: conn,
            envelope: envelope.clone(),
        });
        for to in self.peers(chunk, &player) {
            out.push(Outbound {
                to,
                envelope: envelope.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_shared::net::{events, Ping};

    fn addressed<'a>(out: &'a [Outbound], conn: ConnId, event: &'a str) -> impl Iterator<Item = &'a Envelope> {
        out.iter()
            .filter(move |o| o.to == conn && o.envelope.event == event)
            .map(|o| &o.envelope)
    }

    fn auth(world: &mut WorldServer, conn: ConnId, credential: &str) -> String {
        let out = world.handle(
            conn,
            ClientMsg::Auth(AuthRequest {
                credential: credential.into(),
                name: None,
            })
            .encode(),
        );
        let env = addressed(&out, conn, events::AUTH_SUCCESS).next().unwrap();
        env.payload::<AuthSuccess>().unwrap().player_id
    }

    fn enter(world: &mut WorldServer, conn: ConnId, x: i32, y: i32) -> Vec<Outbound> {
        world.handle(conn, ClientMsg::ChunkEnter(ChunkEnter { x, y }).encode())
    }

    #[test]
    fn empty_credential_is_rejected() {
        let mut world = WorldServer::new(WorldConfig::default());
        let conn = world.connect();
        let out = world.handle(
            conn,
            ClientMsg::Auth(AuthRequest {
                credential: "  ".into(),
                name: None,
            })
            .encode(),
        );
        assert_eq!(addressed(&out, conn, events::AUTH_ERROR).count(), 1);
        assert_eq!(world.stats().online_players, 0);
    }

    #[test]
    fn same_credential_keeps_identity_and_position() {
        let mut world = WorldServer::new(WorldConfig::default());
        let a = world.connect();
        let id = auth(&mut world, a, "tok");
        world.handle(
            a,
            ClientMsg::PlayerMove(PlayerMove { x: 2_500.0, y: 3_100.0, chunk_x: 2, chunk_y: 3 }).encode(),
        );
        world.disconnect(a);

        let b = world.connect();
        assert_eq!(auth(&mut world, b, "tok"), id);
        assert_eq!(world.player_position(&id), Some(Vec2::new(2_500.0, 3_100.0)));
        assert_eq!(world.player_conn(&id), Some(b));
    }

    #[test]
    fn chunk_contents_are_deterministic_and_include_players() {
        let mut world = WorldServer::new(WorldConfig::default());
        let conn = world.connect();
        let id = auth(&mut world, conn, "tok");
        let first = enter(&mut world, conn, 2, 3);
        let second = enter(&mut world, conn, 2, 3);
        let a = ChunkPayload::from_value(&addressed(&first, conn, events::CHUNK_DATA).next().unwrap().data);
        let b = ChunkPayload::from_value(&addressed(&second, conn, events::CHUNK_DATA).next().unwrap().data);
        assert_eq!(a, b);
        assert_eq!(a.key, Some(PartitionKey::new(2, 3)));
        assert_eq!(a.players.len(), 1);
        assert_eq!(a.players[0].id, id);
        for e in a.entities.values().flatten() {
            assert!((2_000.0..=3_000.0).contains(&e.x), "{e:?}");
            assert!((3_000.0..=4_000.0).contains(&e.y), "{e:?}");
        }
    }

    #[test]
    fn peers_see_join_move_and_leave() {
        let mut world = WorldServer::new(WorldConfig::default());
        let a = world.connect();
        let b = world.connect();
        auth(&mut world, a, "alice");
        let bob = auth(&mut world, b, "bob");
        enter(&mut world, a, 0, 0);

        let out = enter(&mut world, b, 0, 0);
        assert_eq!(addressed(&out, a, events::PLAYER_JOINED).count(), 1);
        assert_eq!(addressed(&out, b, events::PLAYER_JOINED).count(), 0);

        let out = world.handle(
            b,
            ClientMsg::PlayerMove(PlayerMove { x: 5.0, y: 5.0, chunk_x: 0, chunk_y: 0 }).encode(),
        );
        assert_eq!(addressed(&out, a, events::PLAYER_MOVED).count(), 1);
        assert_eq!(addressed(&out, b, events::PLAYER_MOVED).count(), 0);

        let out = world.disconnect(b);
        let left = addressed(&out, a, events::PLAYER_LEFT).next().unwrap();
        assert_eq!(left.payload::<PlayerLeft>().unwrap().id, bob);
    }

    #[test]
    fn leaving_a_chunk_notifies_old_peers() {
        let mut world = WorldServer::new(WorldConfig::default());
        let a = world.connect();
        let b = world.connect();
        auth(&mut world, a, "alice");
        auth(&mut world, b, "bob");
        enter(&mut world, a, 0, 0);
        enter(&mut world, b, 0, 0);
        let out = enter(&mut world, b, 1, 0);
        assert_eq!(addressed(&out, a, events::PLAYER_LEFT).count(), 1);
    }

    #[test]
    fn ping_is_echoed() {
        let mut world = WorldServer::new(WorldConfig::default());
        let conn = world.connect();
        let out = world.handle(conn, ClientMsg::Ping(Ping { timestamp: 42 }).encode());
        let pong = addressed(&out, conn, events::PONG).next().unwrap();
        assert_eq!(pong.payload::<Pong>().unwrap().timestamp, 42);
    }

    #[test]
    fn collected_entities_disappear() {
        let mut world = WorldServer::new(WorldConfig {
            density: 4.0,
            ..Default::default()
        });
        let conn = world.connect();
        auth(&mut world, conn, "tok");
        let out = enter(&mut world, conn, 0, 0);
        let payload = ChunkPayload::from_value(&addressed(&out, conn, events::CHUNK_DATA).next().unwrap().data);
        let target = payload.entities.values().flatten().next().unwrap().id.clone();

        let out = world.handle(conn, Envelope::new(ENTITY_COLLECT, json!({ "id": target })));
        assert_eq!(addressed(&out, conn, events::ENTITY_REMOVED).count(), 1);
        let again = world.generate_chunk(PartitionKey::new(0, 0));
        assert!(again.entities.values().flatten().all(|e| e.id != target));
        assert_eq!(world.stats().collected, 1);
    }
}
