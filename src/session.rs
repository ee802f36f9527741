//! Editor session: one open document wired into both engines.
//!
//! The session owns the canvas and the document id. Canvas change
//! notifications go straight to [`HistoryEngine::capture`]; the history
//! engine's restore guard keeps its own replays out of the stack. Presence
//! gets joined, heartbeated and throttled cursor updates for the same
//! document.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::canvas::{CanvasDocument, ListenerId, SceneCanvas};
use crate::config::PresenceConfig;
use crate::history::HistoryEngine;
use crate::presence::{CursorPosition, PresenceEngine, PresencePhase};

pub struct EditorSession {
    document_id: Uuid,
    canvas: Arc<SceneCanvas>,
    history: Arc<HistoryEngine>,
    presence: PresenceEngine,
    config: PresenceConfig,
    listener: Mutex<Option<ListenerId>>,
    last_cursor: Mutex<Option<Instant>>,
}

impl EditorSession {
    #[must_use]
    pub fn new(document_id: Uuid, canvas: Arc<SceneCanvas>, presence: PresenceEngine, config: PresenceConfig) -> Self {
        let history = Arc::new(HistoryEngine::with_canvas(Arc::clone(&canvas) as Arc<dyn CanvasDocument>));
        Self {
            document_id,
            canvas,
            history,
            presence,
            config,
            listener: Mutex::new(None),
            last_cursor: Mutex::new(None),
        }
    }

    /// Call after the canvas has loaded the document. Seeds history, starts
    /// capturing edits, then subscribes, joins and starts the heartbeat.
    pub async fn open(&self) -> PresencePhase {
        self.history.initialize();

        let history = Arc::downgrade(&self.history);
        let id = self.canvas.on_change(move || {
            if let Some(history) = history.upgrade() {
                history.capture();
            }
        });
        if let Some(previous) = self.lock_listener().replace(id) {
            self.canvas.off_change(previous);
        }

        let phase = self.presence.subscribe(self.document_id).await;
        self.presence.join(self.document_id).await;
        self.presence.spawn_heartbeat(self.document_id, self.config.heartbeat);
        info!(document_id = %self.document_id, ?phase, "editor session opened");
        phase
    }

    /// Send the local cursor unless presence is not connected or one was
    /// sent less than the throttle interval ago. Returns whether an update
    /// went out.
    pub async fn cursor_moved(&self, position: CursorPosition) -> bool {
        if !self.presence.is_connected() {
            return false;
        }
        let now = Instant::now();
        {
            let mut last = self.lock_last_cursor();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.config.cursor_throttle {
                    return false;
                }
            }
            *last = Some(now);
        }
        self.presence.update_presence(self.document_id, Some(position)).await
    }

    /// Pointer left the canvas. Never throttled; skipped while disconnected.
    pub async fn cursor_left(&self) -> bool {
        *self.lock_last_cursor() = None;
        if !self.presence.is_connected() {
            return false;
        }
        self.presence.update_presence(self.document_id, None).await
    }

    /// Leave, tear down presence, stop capturing and drop history.
    pub async fn close(&self) {
        // Leave is best effort and must not hold up teardown.
        tokio::join!(self.presence.leave(self.document_id), self.presence.teardown());
        if let Some(id) = self.lock_listener().take() {
            self.canvas.off_change(id);
        }
        self.history.clear();
        debug!(document_id = %self.document_id, "editor session closed");
    }

    #[must_use]
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    #[must_use]
    pub fn canvas(&self) -> &Arc<SceneCanvas> {
        &self.canvas
    }

    #[must_use]
    pub fn history(&self) -> &HistoryEngine {
        &self.history
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceEngine {
        &self.presence
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<ListenerId>> {
        self.listener.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_last_cursor(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_cursor.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        // The presence engine cancels its own subscription on drop.
        if let Some(id) = self.lock_listener().take() {
            self.canvas.off_change(id);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
