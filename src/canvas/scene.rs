//! In-memory scene: board shapes keyed by id, serialized as JSON.
//!
//! Serialization is deterministic (objects ordered by z-index, then id), so
//! two scenes with the same content produce equal snapshots.

#[cfg(test)]
#[path = "scene_test.rs"]
mod scene_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{CanvasDocument, CanvasError, Snapshot};

/// The kind of a scene object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Rect,
    Ellipse,
    Diamond,
    Star,
    Line,
    Arrow,
    Text,
    Sticky,
}

/// A shape on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub id: Uuid,
    pub kind: ObjectKind,
    /// Left edge of the bounding box in world coordinates.
    pub x: f64,
    /// Top edge of the bounding box in world coordinates.
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Clockwise rotation in degrees around the bounding-box center.
    #[serde(default)]
    pub rotation: f64,
    /// Stacking order; lower values are drawn beneath higher values.
    #[serde(default)]
    pub z_index: i64,
    /// Open-ended per-kind properties (fill, stroke, text, ...).
    #[serde(default)]
    pub props: serde_json::Value,
}

impl SceneObject {
    #[must_use]
    pub fn new(kind: ObjectKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            z_index: 0,
            props: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SceneFile {
    objects: Vec<SceneObject>,
}

/// Handle returned by [`SceneCanvas::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// A canvas document backed by a plain object map.
pub struct SceneCanvas {
    objects: Mutex<HashMap<Uuid, SceneObject>>,
    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,
    next_listener: AtomicU64,
    renders: AtomicUsize,
}

impl Default for SceneCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneCanvas {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            renders: AtomicUsize::new(0),
        }
    }

    /// Register a change listener. Listeners run synchronously after each mutation.
    pub fn on_change(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Remove a change listener. Returns false if it was not registered.
    pub fn off_change(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn add(&self, object: SceneObject) {
        self.lock_objects().insert(object.id, object);
        self.emit_change();
    }

    /// Mutate an object in place. Returns false if `id` is unknown.
    pub fn update(&self, id: Uuid, apply: impl FnOnce(&mut SceneObject)) -> bool {
        {
            let mut objects = self.lock_objects();
            let Some(object) = objects.get_mut(&id) else {
                return false;
            };
            apply(object);
        }
        self.emit_change();
        true
    }

    pub fn remove(&self, id: Uuid) -> Option<SceneObject> {
        let removed = self.lock_objects().remove(&id);
        if removed.is_some() {
            self.emit_change();
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<SceneObject> {
        self.lock_objects().get(&id).cloned()
    }

    /// All objects in draw order.
    #[must_use]
    pub fn objects(&self) -> Vec<SceneObject> {
        let mut objects: Vec<SceneObject> = self.lock_objects().values().cloned().collect();
        objects.sort_by(|a, b| a.z_index.cmp(&b.z_index).then(a.id.cmp(&b.id)));
        objects
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_objects().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_objects().is_empty()
    }

    /// Number of render passes requested so far.
    #[must_use]
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::Relaxed)
    }

    fn emit_change(&self) {
        // Clone out so listeners may call back into the canvas.
        let listeners: Vec<ChangeListener> = self.lock_listeners().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener();
        }
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SceneObject>> {
        self.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, ChangeListener)>> {
        self.listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl CanvasDocument for SceneCanvas {
    fn snapshot(&self) -> Snapshot {
        let file = SceneFile { objects: self.objects() };
        // Serializing plain structs with JSON values cannot fail.
        let json = serde_json::to_string(&file).unwrap_or_else(|_| String::from(r#"{"objects":[]}"#));
        Snapshot::from(json)
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<(), CanvasError> {
        let file: SceneFile =
            serde_json::from_str(snapshot.as_str()).map_err(|e| CanvasError::MalformedSnapshot(e.to_string()))?;

        let mut loaded = HashMap::with_capacity(file.objects.len());
        for object in file.objects {
            if loaded.insert(object.id, object).is_some() {
                return Err(CanvasError::Rejected("duplicate object id".into()));
            }
        }

        debug!(objects = loaded.len(), "scene restored");
        *self.lock_objects() = loaded;
        self.emit_change();
        Ok(())
    }

    fn render(&self) {
        self.renders.fetch_add(1, Ordering::Relaxed);
    }
}
