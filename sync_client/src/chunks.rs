//! Chunk stream manager.
//!
//! Keeps the partitions the local player occupies materialised in the scene:
//! - requests a partition when the player crosses a chunk boundary
//! - applies `chunk:data` by clearing the partition, then populating it
//! - tracks remote players and glides them between position reports
//!
//! Every outbound message goes through a `MessageSink` (the connection
//! manager in production). Partition requests are never queued while the
//! session is down; the next authentication issues exactly one request.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use serde::Serialize;
use sync_shared::{
    chunk::{ChunkPayload, EntityKind, PartitionKey},
    config::ChunkConfig,
    event::EventQueue,
    math::Vec2,
    net::{ChunkEnter, ClientMsg, PlayerInfo, PlayerMove, PlayerMoved, ServerMsg},
    render::{RenderHandle, SceneObject, SceneSink},
    transport::Transport,
};
use tracing::{debug, info, warn};

use crate::{connection::ConnectionManager, interp::Glide};

/// Outbound path used by the chunk manager.
pub trait MessageSink {
    fn send_msg(&mut self, msg: ClientMsg, now: Instant);
    fn is_authenticated(&self) -> bool;
    /// Called whenever the current partition changes.
    fn track_partition(&mut self, key: PartitionKey);
}

impl<T: Transport> MessageSink for ConnectionManager<T> {
    fn send_msg(&mut self, msg: ClientMsg, now: Instant) {
        ConnectionManager::send_msg(self, &msg, now);
    }

    fn is_authenticated(&self) -> bool {
        ConnectionManager::is_authenticated(self)
    }

    fn track_partition(&mut self, key: PartitionKey) {
        ConnectionManager::track_partition(self, key);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub kind: EntityKind,
    pub position: Vec2,
    pub handle: RenderHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlayerRecord {
    pub id: String,
    pub display_name: String,
    pub glide: Glide,
    pub health: f32,
    pub max_health: f32,
    pub handle: RenderHandle,
}

impl RemotePlayerRecord {
    pub fn position(&self) -> Vec2 {
        self.glide.current()
    }
}

/// A materialised chunk.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub entities: HashMap<String, EntityRecord>,
    pub players: HashMap<String, RemotePlayerRecord>,
    /// Players added by `player:joined` since the last payload for this
    /// partition. They survive the next payload's clear.
    joined_since_payload: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    PartitionChanged {
        from: Option<PartitionKey>,
        to: PartitionKey,
    },
    PartitionLoaded {
        key: PartitionKey,
        entities: usize,
        players: usize,
    },
    PlayerJoined {
        id: String,
    },
    PlayerLeft {
        id: String,
    },
    EntityRemoved {
        id: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkStats {
    pub current_partition: Option<PartitionKey>,
    pub partitions: usize,
    pub entities: usize,
    pub players: usize,
    pub requests_sent: u64,
    pub payloads_applied: u64,
    pub stale_payloads: u64,
    pub dropped_items: u64,
    pub duplicate_players: u64,
    pub moves_sent: u64,
    pub moves_throttled: u64,
}

pub struct ChunkManager {
    config: ChunkConfig,
    scene: Box<dyn SceneSink>,
    local_id: Option<String>,
    current: Option<PartitionKey>,
    request_deferred: bool,
    partitions: HashMap<PartitionKey, Partition>,
    local_position: Vec2,
    last_move_sent: Option<Instant>,
    stats: ChunkStats,
    events: EventQueue<ChunkEvent>,
}

impl ChunkManager {
    pub fn new(config: ChunkConfig, scene: impl SceneSink + 'static) -> Self {
        Self {
            config,
            scene: Box::new(scene),
            local_id: None,
            current: None,
            request_deferred: false,
            partitions: HashMap::new(),
            local_position: Vec2::ZERO,
            last_move_sent: None,
            stats: ChunkStats::default(),
            events: EventQueue::new(),
        }
    }

    pub fn current_partition(&self) -> Option<PartitionKey> {
        self.current
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn local_position(&self) -> Vec2 {
        self.local_position
    }

    pub fn partition(&self, key: PartitionKey) -> Option<&Partition> {
        self.partitions.get(&key)
    }

    pub fn player(&self, id: &str) -> Option<&RemotePlayerRecord> {
        self.partitions.values().find_map(|p| p.players.get(id))
    }

    pub fn entity_count(&self) -> usize {
        self.partitions.values().map(|p| p.entities.len()).sum()
    }

    pub fn player_count(&self) -> usize {
        self.partitions.values().map(|p| p.players.len()).sum()
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            current_partition: self.current,
            partitions: self.partitions.len(),
            entities: self.entity_count(),
            players: self.player_count(),
            ..self.stats.clone()
        }
    }

    pub fn drain_events(&mut self) -> Vec<ChunkEvent> {
        self.events.drain()
    }

    // ─── Movement ───

    /// Moves to `key`. A no-op if already there.
    pub fn enter_partition(&mut self, key: PartitionKey, now: Instant, sink: &mut impl MessageSink) {
        if self.current == Some(key) {
            debug!(%key, "Already in partition");
            return;
        }
        let from = self.current.replace(key);
        if let Some(old) = from {
            self.clear_partition(old);
        }
        info!(?from, to = %key, "Entering partition");
        sink.track_partition(key);
        self.events.push(ChunkEvent::PartitionChanged { from, to: key });
        self.request(key, now, sink);
    }

    /// Records the local position and, at most once per send interval,
    /// forwards it to the server. Returns whether a move was sent.
    pub fn update_local_position(&mut self, pos: Vec2, now: Instant, sink: &mut impl MessageSink) -> bool {
        self.local_position = pos;
        if let Some(last) = self.last_move_sent {
            if now.saturating_duration_since(last) < self.config.position_send_interval() {
                self.stats.moves_throttled += 1;
                return false;
            }
        }
        self.last_move_sent = Some(now);

        let key = PartitionKey::from_position(pos, self.config.chunk_size);
        if self.current != Some(key) {
            self.enter_partition(key, now, sink);
        }
        sink.send_msg(
            ClientMsg::PlayerMove(PlayerMove {
                x: pos.x,
                y: pos.y,
                chunk_x: key.x,
                chunk_y: key.y,
            }),
            now,
        );
        self.stats.moves_sent += 1;
        true
    }

    /// Issues the single partition request that follows authentication:
    /// the restored key if any, else the current one, else the chunk under
    /// the local position.
    pub fn on_authenticated(
        &mut self,
        player_id: &str,
        restored_key: Option<PartitionKey>,
        now: Instant,
        sink: &mut impl MessageSink,
    ) {
        self.local_id = Some(player_id.to_string());
        self.remove_player(player_id);
        self.request_deferred = false;

        let here = PartitionKey::from_position(self.local_position, self.config.chunk_size);
        if let Some(restored) = restored_key.filter(|k| *k != here) {
            debug!(%restored, %here, "Restoring a partition the local player has left");
        }
        let key = restored_key.or(self.current).unwrap_or(here);
        if self.current != Some(key) {
            let from = self.current.replace(key);
            if let Some(old) = from {
                self.clear_partition(old);
            }
            self.events.push(ChunkEvent::PartitionChanged { from, to: key });
        }
        sink.track_partition(key);
        self.request(key, now, sink);
    }

    fn request(&mut self, key: PartitionKey, now: Instant, sink: &mut impl MessageSink) {
        if !sink.is_authenticated() {
            debug!(%key, "Partition request deferred until authenticated");
            self.request_deferred = true;
            return;
        }
        sink.send_msg(ClientMsg::ChunkEnter(ChunkEnter { x: key.x, y: key.y }), now);
        self.stats.requests_sent += 1;
    }

    pub fn has_deferred_request(&self) -> bool {
        self.request_deferred
    }

    // ─── Inbound ───

    /// Applies a server message. Returns `false` for messages this manager
    /// does not handle.
    pub fn handle_server_msg(&mut self, msg: &ServerMsg) -> bool {
        match msg {
            ServerMsg::ChunkData(payload) => self.on_chunk_data(payload),
            ServerMsg::PlayerJoined(info) => self.on_player_joined(info),
            ServerMsg::PlayerLeft(left) => {
                if self.remove_player(&left.id) {
                    self.events.push(ChunkEvent::PlayerLeft { id: left.id.clone() });
                }
            }
            ServerMsg::PlayerMoved(moved) => self.on_player_moved(moved),
            ServerMsg::EntityRemoved(removed) => self.on_entity_removed(&removed.id),
            _ => return false,
        }
        true
    }

    fn on_chunk_data(&mut self, payload: &ChunkPayload) {
        self.stats.dropped_items += payload.dropped as u64;
        let Some(key) = payload.key else {
            warn!("chunk:data without a usable key");
            return;
        };
        if self.current != Some(key) {
            debug!(%key, current = ?self.current, "Ignoring data for a partition we left");
            self.stats.stale_payloads += 1;
            return;
        }

        let mut part = Partition::default();
        if let Some(mut old) = self.partitions.remove(&key) {
            for id in old.joined_since_payload.drain() {
                if let Some(record) = old.players.remove(&id) {
                    part.players.insert(id, record);
                }
            }
            self.partitions.insert(key, old);
            self.clear_partition(key);
        }
        for (kind, list) in &payload.entities {
            for e in list {
                if part.entities.contains_key(&e.id) {
                    warn!(id = %e.id, "Duplicate entity id in chunk payload");
                    continue;
                }
                let handle = self.scene.create(SceneObject::Entity(*kind), &e.id, e.position());
                part.entities.insert(
                    e.id.clone(),
                    EntityRecord {
                        id: e.id.clone(),
                        kind: *kind,
                        position: e.position(),
                        handle,
                    },
                );
            }
        }
        for p in &payload.players {
            if self.is_local(&p.id) {
                continue;
            }
            if part.players.contains_key(&p.id) || self.player(&p.id).is_some() {
                debug!(id = %p.id, "Player already tracked, keeping first record");
                self.stats.duplicate_players += 1;
                continue;
            }
            let record = self.spawn_player(p);
            part.players.insert(p.id.clone(), record);
        }

        let (entities, players) = (part.entities.len(), part.players.len());
        self.partitions.insert(key, part);
        self.stats.payloads_applied += 1;
        info!(%key, entities, players, "Partition loaded");
        self.events.push(ChunkEvent::PartitionLoaded { key, entities, players });
    }

    fn on_player_joined(&mut self, info: &PlayerInfo) {
        if self.is_local(&info.id) {
            return;
        }
        if self.player(&info.id).is_some() {
            debug!(id = %info.id, "Join for tracked player ignored");
            self.stats.duplicate_players += 1;
            return;
        }
        let Some(key) = self.current else {
            debug!(id = %info.id, "Join before entering a partition ignored");
            return;
        };
        let record = self.spawn_player(info);
        let part = self.partitions.entry(key).or_default();
        part.players.insert(info.id.clone(), record);
        part.joined_since_payload.insert(info.id.clone());
        self.events.push(ChunkEvent::PlayerJoined { id: info.id.clone() });
    }

    fn on_player_moved(&mut self, moved: &PlayerMoved) {
        if self.is_local(&moved.id) {
            return;
        }
        let target = Vec2::new(moved.x, moved.y);
        match self
            .partitions
            .values_mut()
            .find_map(|p| p.players.get_mut(&moved.id))
        {
            Some(record) => record.glide.retarget(target),
            None => debug!(id = %moved.id, "Move for untracked player"),
        }
    }

    fn on_entity_removed(&mut self, id: &str) {
        for part in self.partitions.values_mut() {
            if let Some(e) = part.entities.remove(id) {
                self.scene.destroy(e.handle);
                self.events.push(ChunkEvent::EntityRemoved { id: id.to_string() });
                return;
            }
        }
        debug!(%id, "Remove for unknown entity");
    }

    // ─── Frame ───

    /// Advances remote player interpolation. Returns how many players moved.
    pub fn update(&mut self, dt: Duration) -> usize {
        let mut moved = 0;
        for part in self.partitions.values_mut() {
            for record in part.players.values_mut() {
                if record.glide.is_settled() {
                    continue;
                }
                let pos = record.glide.advance(dt);
                self.scene.move_to(record.handle, pos);
                moved += 1;
            }
        }
        moved
    }

    /// Destroys everything and forgets the local identity.
    pub fn reset(&mut self) {
        let keys: Vec<_> = self.partitions.keys().copied().collect();
        for key in keys {
            self.clear_partition(key);
        }
        self.current = None;
        self.local_id = None;
        self.request_deferred = false;
        self.last_move_sent = None;
    }

    fn is_local(&self, id: &str) -> bool {
        self.local_id.as_deref() == Some(id)
    }

    fn spawn_player(&mut self, info: &PlayerInfo) -> RemotePlayerRecord {
        let pos = Vec2::new(info.x, info.y);
        RemotePlayerRecord {
            id: info.id.clone(),
            display_name: info.display_name.clone(),
            glide: Glide::at(pos, self.config.interpolation()),
            health: info.health,
            max_health: info.max_health,
            handle: self.scene.create(SceneObject::RemotePlayer, &info.id, pos),
        }
    }

    fn remove_player(&mut self, id: &str) -> bool {
        for part in self.partitions.values_mut() {
            if let Some(record) = part.players.remove(id) {
                part.joined_since_payload.remove(id);
                self.scene.destroy(record.handle);
                return true;
            }
        }
        false
    }

    fn clear_partition(&mut self, key: PartitionKey) {
        let Some(part) = self.partitions.remove(&key) else {
            return;
        };
        for e in part.entities.into_values() {
            self.scene.destroy(e.handle);
        }
        for p in part.players.into_values() {
            self.scene.destroy(p.handle);
        }
        debug!(%key, "Partition cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_shared::{
        chunk::EntityInfo,
        net::{EntityRemoved, PlayerLeft},
        render::RecordingScene,
    };

    #[derive(Default)]
    struct Outbox {
        authenticated: bool,
        sent: Vec<ClientMsg>,
        tracked: Option<PartitionKey>,
    }

    impl Outbox {
        fn authed() -> Self {
            Self {
                authenticated: true,
                ..Default::default()
            }
        }

        fn enters(&self) -> Vec<ChunkEnter> {
            self.sent
                .iter()
                .filter_map(|m| match m {
                    ClientMsg::ChunkEnter(e) => Some(*e),
                    _ => None,
                })
                .collect()
        }

        fn moves(&self) -> usize {
            self.sent
                .iter()
                .filter(|m| matches!(m, ClientMsg::PlayerMove(_)))
                .count()
        }
    }

    impl MessageSink for Outbox {
        fn send_msg(&mut self, msg: ClientMsg, _now: Instant) {
            self.sent.push(msg);
        }
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }
        fn track_partition(&mut self, key: PartitionKey) {
            self.tracked = Some(key);
        }
    }

    fn manager() -> (ChunkManager, RecordingScene) {
        let scene = RecordingScene::new();
        (ChunkManager::new(ChunkConfig::default(), scene.clone()), scene)
    }

    fn player(id: &str, x: f32, y: f32) -> PlayerInfo {
        serde_json::from_value(json!({ "id": id, "name": id, "x": x, "y": y })).unwrap()
    }

    fn payload(key: PartitionKey, asteroids: &[&str], players: &[PlayerInfo]) -> ServerMsg {
        let mut p = ChunkPayload::new(key);
        p.entities.insert(
            EntityKind::Asteroid,
            asteroids
                .iter()
                .map(|id| EntityInfo { id: id.to_string(), x: 1.0, y: 1.0 })
                .collect(),
        );
        p.players = players.to_vec();
        ServerMsg::ChunkData(p)
    }

    #[test]
    fn entering_same_partition_is_a_noop() {
        let (mut cm, _) = manager();
        let mut out = Outbox::authed();
        let now = Instant::now();
        cm.enter_partition(PartitionKey::new(1, 1), now, &mut out);
        cm.enter_partition(PartitionKey::new(1, 1), now, &mut out);
        assert_eq!(out.enters(), vec![ChunkEnter { x: 1, y: 1 }]);
        assert_eq!(out.tracked, Some(PartitionKey::new(1, 1)));
    }

    #[test]
    fn reapplying_partition_replaces_contents_exactly() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        let key = PartitionKey::new(0, 0);
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        cm.handle_server_msg(&payload(key, &["a", "b"], &[player("p2", 0.0, 0.0)]));
        cm.handle_server_msg(&payload(key, &["c"], &[player("p3", 5.0, 5.0)]));

        let part = cm.partition(key).unwrap();
        let mut ids: Vec<_> = part.entities.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["c"]);
        assert_eq!(part.players.keys().collect::<Vec<_>>(), vec!["p3"]);
        let s = scene.state();
        assert_eq!(s.live.len(), 2);
        assert_eq!(s.destroyed, 3);
    }

    #[test]
    fn local_player_is_never_tracked() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let key = cm.current_partition().unwrap();
        cm.handle_server_msg(&payload(key, &[], &[player("me", 0.0, 0.0), player("p2", 1.0, 1.0)]));
        cm.handle_server_msg(&ServerMsg::PlayerJoined(player("me", 3.0, 3.0)));
        assert!(cm.player("me").is_none());
        assert!(cm.player("p2").is_some());
        assert_eq!(scene.state().count(SceneObject::RemotePlayer), 1);
    }

    #[test]
    fn join_after_arrival_is_first_writer_wins() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let key = cm.current_partition().unwrap();
        cm.handle_server_msg(&payload(key, &[], &[player("p2", 1.0, 1.0), player("p2", 9.0, 9.0)]));
        cm.handle_server_msg(&ServerMsg::PlayerJoined(player("p2", 7.0, 7.0)));

        assert_eq!(cm.player("p2").unwrap().position(), Vec2::new(1.0, 1.0));
        assert_eq!(scene.state().count(SceneObject::RemotePlayer), 1);
        assert_eq!(cm.stats().duplicate_players, 2);
    }

    #[test]
    fn join_before_arrival_keeps_joined_record() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let key = cm.current_partition().unwrap();
        cm.handle_server_msg(&ServerMsg::PlayerJoined(player("p2", 7.0, 7.0)));
        let handle = cm.player("p2").unwrap().handle;
        cm.handle_server_msg(&payload(key, &["a"], &[player("p2", 1.0, 1.0), player("p3", 2.0, 2.0)]));

        let p2 = cm.player("p2").unwrap();
        assert_eq!(p2.position(), Vec2::new(7.0, 7.0));
        assert_eq!(p2.handle, handle);
        let s = scene.state();
        assert_eq!(s.count(SceneObject::RemotePlayer), 2);
        assert_eq!(s.destroyed, 0);
        drop(s);
        assert_eq!(cm.stats().duplicate_players, 1);

        // The next payload treats p2 like any other payload player.
        cm.handle_server_msg(&payload(key, &[], &[player("p3", 2.0, 2.0)]));
        assert!(cm.player("p2").is_none());
        assert_eq!(scene.state().count(SceneObject::RemotePlayer), 1);
    }

    #[test]
    fn data_for_a_left_partition_is_ignored() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        let now = Instant::now();
        cm.enter_partition(PartitionKey::new(0, 0), now, &mut out);
        cm.enter_partition(PartitionKey::new(1, 0), now, &mut out);
        cm.handle_server_msg(&payload(PartitionKey::new(0, 0), &["a"], &[]));
        assert_eq!(cm.entity_count(), 0);
        assert_eq!(scene.state().created, 0);
        assert_eq!(cm.stats().stale_payloads, 1);
    }

    #[test]
    fn request_waits_for_authentication_then_uses_restored_key() {
        let (mut cm, _) = manager();
        let mut out = Outbox::default();
        let now = Instant::now();
        cm.enter_partition(PartitionKey::new(2, 3), now, &mut out);
        assert!(out.enters().is_empty());
        assert!(cm.has_deferred_request());

        out.authenticated = true;
        cm.on_authenticated("me", Some(PartitionKey::new(2, 3)), now, &mut out);
        assert_eq!(out.enters(), vec![ChunkEnter { x: 2, y: 3 }]);
        assert!(!cm.has_deferred_request());
    }

    #[test]
    fn restore_requests_snapshot_key_even_after_moving_away() {
        let (mut cm, _) = manager();
        let mut out = Outbox::default();
        let t0 = Instant::now();
        cm.update_local_position(Vec2::new(4_200.0, 10.0), t0, &mut out);
        assert_eq!(cm.current_partition(), Some(PartitionKey::new(4, 0)));

        out.authenticated = true;
        cm.on_authenticated("me", Some(PartitionKey::new(1, 0)), t0, &mut out);
        assert_eq!(out.enters(), vec![ChunkEnter { x: 1, y: 0 }]);
        assert_eq!(cm.current_partition(), Some(PartitionKey::new(1, 0)));

        // The next position report moves the client back where it is.
        cm.update_local_position(Vec2::new(4_210.0, 10.0), t0 + Duration::from_millis(200), &mut out);
        assert_eq!(out.enters().last(), Some(&ChunkEnter { x: 4, y: 0 }));
    }

    #[test]
    fn position_updates_are_rate_limited_and_cross_boundaries() {
        let (mut cm, _) = manager();
        let mut out = Outbox::authed();
        let t0 = Instant::now();
        assert!(cm.update_local_position(Vec2::new(10.0, 10.0), t0, &mut out));
        assert!(!cm.update_local_position(Vec2::new(20.0, 10.0), t0 + Duration::from_millis(50), &mut out));
        assert!(cm.update_local_position(Vec2::new(1_500.0, 10.0), t0 + Duration::from_millis(100), &mut out));

        assert_eq!(out.moves(), 2);
        assert_eq!(
            out.enters(),
            vec![ChunkEnter { x: 0, y: 0 }, ChunkEnter { x: 1, y: 0 }]
        );
        assert_eq!(cm.stats().moves_throttled, 1);
        assert_eq!(cm.local_position(), Vec2::new(1_500.0, 10.0));
    }

    #[test]
    fn remote_players_glide_to_reported_position() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let key = cm.current_partition().unwrap();
        cm.handle_server_msg(&payload(key, &[], &[player("p2", 0.0, 0.0)]));
        cm.handle_server_msg(&ServerMsg::PlayerMoved(PlayerMoved {
            id: "p2".into(),
            x: 10.0,
            y: 0.0,
        }));

        assert_eq!(cm.update(Duration::from_millis(50)), 1);
        assert_eq!(scene.state().position_of("p2"), Some(Vec2::new(5.0, 0.0)));
        cm.update(Duration::from_millis(50));
        assert_eq!(scene.state().position_of("p2"), Some(Vec2::new(10.0, 0.0)));
        assert_eq!(cm.update(Duration::from_millis(50)), 0);
    }

    #[test]
    fn leave_and_remove_destroy_render_objects() {
        let (mut cm, scene) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let key = cm.current_partition().unwrap();
        cm.handle_server_msg(&payload(key, &["a"], &[player("p2", 0.0, 0.0)]));
        cm.handle_server_msg(&ServerMsg::PlayerLeft(PlayerLeft { id: "p2".into() }));
        cm.handle_server_msg(&ServerMsg::EntityRemoved(EntityRemoved { id: "a".into() }));
        assert!(scene.state().live.is_empty());
        let events = cm.drain_events();
        assert!(events.contains(&ChunkEvent::PlayerLeft { id: "p2".into() }));
        assert!(events.contains(&ChunkEvent::EntityRemoved { id: "a".into() }));
    }

    #[test]
    fn keyless_payload_is_tolerated() {
        let (mut cm, _) = manager();
        let mut out = Outbox::authed();
        cm.on_authenticated("me", None, Instant::now(), &mut out);
        let msg = ServerMsg::ChunkData(ChunkPayload::from_value(&json!({ "entities": 3 })));
        assert!(cm.handle_server_msg(&msg));
        assert_eq!(cm.entity_count(), 0);
    }
}
