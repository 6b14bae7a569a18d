//! Spatial partitioning.
//!
//! The world is cut into square chunks of `chunk_size` units. A chunk is
//! addressed by `PartitionKey = floor(position / chunk_size)` and its contents
//! arrive from the server as a `chunk:data` payload.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{math::Vec2, net::PlayerInfo};

/// Grid coordinate of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub x: i32,
    pub y: i32,
}

impl PartitionKey {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing `pos`. Negative coordinates floor toward -inf.
    pub fn from_position(pos: Vec2, chunk_size: f32) -> Self {
        Self {
            x: (pos.x / chunk_size).floor() as i32,
            y: (pos.y / chunk_size).floor() as i32,
        }
    }

    /// World-space centre of this chunk.
    pub fn center(self, chunk_size: f32) -> Vec2 {
        Vec2::new(
            (self.x as f32 + 0.5) * chunk_size,
            (self.y as f32 + 0.5) * chunk_size,
        )
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for PartitionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| format!("chunk key without comma: {s:?}"))?;
        let x = x.trim().parse().map_err(|_| format!("bad chunk x in {s:?}"))?;
        let y = y.trim().parse().map_err(|_| format!("bad chunk y in {s:?}"))?;
        Ok(Self { x, y })
    }
}

/// Kinds of world entities a chunk can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Asteroid,
    Crystal,
    Resource,
    Planet,
    Npc,
    Station,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Asteroid,
        EntityKind::Crystal,
        EntityKind::Resource,
        EntityKind::Planet,
        EntityKind::Npc,
        EntityKind::Station,
    ];

    /// Key of this kind's list inside a `chunk:data` payload.
    pub fn collection_name(self) -> &'static str {
        match self {
            EntityKind::Asteroid => "asteroids",
            EntityKind::Crystal => "crystals",
            EntityKind::Resource => "resources",
            EntityKind::Planet => "planets",
            EntityKind::Npc => "npcs",
            EntityKind::Station => "stations",
        }
    }

    /// Accepts both the plural collection name and the singular kind name.
    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.collection_name() == name || k.collection_name().trim_end_matches('s') == name)
    }
}

/// One entity inside a chunk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub id: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

impl EntityInfo {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Decoded `chunk:data` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPayload {
    /// `None` when the payload carried no usable key.
    pub key: Option<PartitionKey>,
    pub entities: BTreeMap<EntityKind, Vec<EntityInfo>>,
    pub players: Vec<PlayerInfo>,
    /// Items dropped while decoding (unknown kinds, malformed entries).
    pub dropped: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireChunk<'a> {
    chunk_key: String,
    entities: BTreeMap<&'static str, &'a Vec<EntityInfo>>,
    players: &'a Vec<PlayerInfo>,
}

impl Serialize for ChunkPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireChunk {
            chunk_key: self.key.map(|k| k.to_string()).unwrap_or_default(),
            entities: self
                .entities
                .iter()
                .map(|(kind, list)| (kind.collection_name(), list))
                .collect(),
            players: &self.players,
        }
        .serialize(serializer)
    }
}

impl ChunkPayload {
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    /// Tolerant decode: anything missing or malformed becomes empty and is
    /// counted in `dropped`, never an error.
    pub fn from_value(data: &Value) -> Self {
        let mut out = ChunkPayload {
            key: decode_key(data),
            ..Default::default()
        };

        if let Some(groups) = data.get("entities").and_then(Value::as_object) {
            for (name, items) in groups {
                let Some(kind) = EntityKind::from_collection(name) else {
                    let n = items.as_array().map_or(1, Vec::len);
                    warn!(kind = %name, items = n, "Dropping unknown entity kind");
                    out.dropped += n;
                    continue;
                };
                let Some(items) = items.as_array() else {
                    warn!(kind = %name, "Entity list is not an array");
                    out.dropped += 1;
                    continue;
                };
                let list = out.entities.entry(kind).or_default();
                for item in items {
                    match EntityInfo::deserialize(item) {
                        Ok(e) => list.push(e),
                        Err(e) => {
                            warn!(kind = %name, error = %e, "Dropping malformed entity");
                            out.dropped += 1;
                        }
                    }
                }
            }
        }

        if let Some(players) = data.get("players").and_then(Value::as_array) {
            for item in players {
                match PlayerInfo::deserialize(item) {
                    Ok(p) => out.players.push(p),
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed player entry");
                        out.dropped += 1;
                    }
                }
            }
        }

        out
    }
}

fn decode_key(data: &Value) -> Option<PartitionKey> {
    if let Some(key) = data.get("chunkKey").and_then(Value::as_str) {
        match key.parse() {
            Ok(k) => return Some(k),
            Err(e) => warn!(error = %e, "Malformed chunk key"),
        }
    }
    let x = data.get("chunkX").and_then(Value::as_i64)?;
    let y = data.get("chunkY").and_then(Value::as_i64)?;
    Some(PartitionKey::new(x as i32, y as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_floors_negative_positions() {
        assert_eq!(
            PartitionKey::from_position(Vec2::new(-0.5, 1999.9), 1000.0),
            PartitionKey::new(-1, 1)
        );
        assert_eq!(
            PartitionKey::from_position(Vec2::new(2500.0, 3000.0), 1000.0),
            PartitionKey::new(2, 3)
        );
    }

    #[test]
    fn key_parses_display_form() {
        let k: PartitionKey = "-4, 7".parse().unwrap();
        assert_eq!(k, PartitionKey::new(-4, 7));
        assert_eq!(k.to_string(), "-4,7");
        assert!("12".parse::<PartitionKey>().is_err());
    }

    #[test]
    fn kind_lookup_accepts_singular_and_plural() {
        assert_eq!(EntityKind::from_collection("asteroids"), Some(EntityKind::Asteroid));
        assert_eq!(EntityKind::from_collection("station"), Some(EntityKind::Station));
        assert_eq!(EntityKind::from_collection("wormholes"), None);
    }

    #[test]
    fn payload_tolerates_partial_and_malformed_fields() {
        let payload = ChunkPayload::from_value(&json!({
            "chunkKey": "2,3",
            "entities": {
                "asteroids": [{ "id": "a1", "x": 1.0, "y": 2.0 }, { "x": 5.0 }],
                "wormholes": [{ "id": "w1" }],
                "crystals": "nope"
            }
        }));
        assert_eq!(payload.key, Some(PartitionKey::new(2, 3)));
        assert_eq!(payload.entities[&EntityKind::Asteroid].len(), 1);
        assert!(payload.players.is_empty());
        // missing id + unknown kind + non-array list
        assert_eq!(payload.dropped, 3);
    }

    #[test]
    fn payload_from_garbage_is_empty() {
        let payload = ChunkPayload::from_value(&json!("not an object"));
        assert_eq!(payload, ChunkPayload::default());
    }

    #[test]
    fn payload_serialises_to_wire_shape() {
        let mut payload = ChunkPayload::new(PartitionKey::new(0, -1));
        payload.entities.insert(
            EntityKind::Planet,
            vec![EntityInfo { id: "p".into(), x: 1.0, y: 1.0 }],
        );
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["chunkKey"], "0,-1");
        assert_eq!(v["entities"]["planets"][0]["id"], "p");
        assert_eq!(ChunkPayload::from_value(&v), payload);
    }
}
