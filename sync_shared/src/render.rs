//! Scene abstraction.
//!
//! No rendering engine is linked here. The chunk stream manager drives
//! whatever implements `SceneSink`: it creates a render object when an entity
//! or remote player materialises, moves it while interpolating, and destroys
//! it when its chunk is cleared.

use std::sync::{Arc, Mutex};

use crate::{chunk::EntityKind, math::Vec2};

/// Opaque handle returned by the scene for a created object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderHandle(pub u64);

/// What the scene is asked to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneObject {
    Entity(EntityKind),
    RemotePlayer,
}

pub trait SceneSink: Send {
    fn create(&mut self, object: SceneObject, id: &str, position: Vec2) -> RenderHandle;
    fn move_to(&mut self, handle: RenderHandle, position: Vec2);
    fn destroy(&mut self, handle: RenderHandle);
}

/// A scene that only hands out handles, for headless clients.
#[derive(Default)]
pub struct NullScene {
    next: u64,
}

impl SceneSink for NullScene {
    fn create(&mut self, _object: SceneObject, _id: &str, _position: Vec2) -> RenderHandle {
        self.next += 1;
        RenderHandle(self.next)
    }
    fn move_to(&mut self, _handle: RenderHandle, _position: Vec2) {}
    fn destroy(&mut self, _handle: RenderHandle) {}
}

/// Live objects tracked by a `RecordingScene`.
#[derive(Debug, Default)]
pub struct SceneState {
    next: u64,
    pub live: Vec<(RenderHandle, SceneObject, String, Vec2)>,
    pub created: usize,
    pub destroyed: usize,
}

impl SceneState {
    pub fn position_of(&self, id: &str) -> Option<Vec2> {
        self.live.iter().find(|o| o.2 == id).map(|o| o.3)
    }

    pub fn count(&self, object: SceneObject) -> usize {
        self.live.iter().filter(|o| o.1 == object).count()
    }
}

/// A scene that keeps every live object, for tests.
#[derive(Clone, Default)]
pub struct RecordingScene {
    state: Arc<Mutex<SceneState>>,
}

impl RecordingScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, SceneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SceneSink for RecordingScene {
    fn create(&mut self, object: SceneObject, id: &str, position: Vec2) -> RenderHandle {
        let mut s = self.state();
        s.next += 1;
        let handle = RenderHandle(s.next);
        s.live.push((handle, object, id.to_string(), position));
        s.created += 1;
        handle
    }

    fn move_to(&mut self, handle: RenderHandle, position: Vec2) {
        if let Some(o) = self.state().live.iter_mut().find(|o| o.0 == handle) {
            o.3 = position;
        }
    }

    fn destroy(&mut self, handle: RenderHandle) {
        let mut s = self.state();
        let before = s.live.len();
        s.live.retain(|o| o.0 != handle);
        if s.live.len() < before {
            s.destroyed += 1;
        }
    }
}
