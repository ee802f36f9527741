//! History engine: linear undo/redo over whole-canvas snapshots.
//!
//! DESIGN
//! ======
//! The stack holds one [`Snapshot`] per completed edit plus a cursor (`step`)
//! at the snapshot currently on screen. Capturing while the cursor is behind
//! the tip drops the redo branch; there is no tree history.
//!
//! The canvas fires its "changed" notification for programmatic restores too,
//! and hosts wire that notification straight to [`HistoryEngine::capture`].
//! A [`RestoreGuard`] is held for the whole restore (load + render) and
//! `capture` checks it first, so replays are never recorded. The guard is
//! released in `Drop`, which covers failed restores and futures dropped
//! mid-flight; a stuck guard would disable capture for the rest of the
//! session.
//!
//! CONCURRENCY
//! ===========
//! All methods take `&self` so a canvas listener can call back into the
//! engine while a restore is suspended. Stack locks are never held across
//! an await. Navigation calls are not queued: a second navigation issued
//! while one is in flight returns [`Navigation::Busy`].
//! Resetting the stack while a restore is suspended wins over the restore:
//! the navigation returns [`Navigation::Superseded`] without moving the
//! cursor of the new stack.

pub mod shortcut;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::canvas::{CanvasDocument, Snapshot};
use crate::error::ErrorCode;

pub use shortcut::{HistoryCommand, Modifiers};

// =============================================================================
// TYPES
// =============================================================================

/// Outcome of `undo`, `redo`, or `jump_to_step`. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    /// The canvas now shows `stack[step]`.
    Moved { step: usize },
    /// Nothing to undo or redo.
    AtBoundary,
    /// Requested step is outside the stack.
    OutOfRange,
    /// Another restore is still in flight.
    Busy,
    /// No canvas is bound.
    Unbound,
    /// The canvas refused the snapshot; the cursor did not move.
    RestoreFailed,
    /// The stack was reset (initialize, clear, rebind) while the restore ran.
    /// The cursor belongs to the new stack and was left alone.
    Superseded,
}

impl Navigation {
    #[must_use]
    pub fn moved(self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

/// Observable flags for toolbar buttons and the history panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStatus {
    pub step: usize,
    pub len: usize,
    pub can_undo: bool,
    pub can_redo: bool,
}

/// One row of the history panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub index: usize,
    pub label: String,
    pub steps_ago: String,
    pub current: bool,
}

#[derive(Debug, Default)]
struct HistoryStack {
    entries: Vec<Snapshot>,
    step: usize,
    /// Bumped whenever the stack is replaced rather than extended.
    epoch: u64,
}

impl HistoryStack {
    fn status(&self) -> HistoryStatus {
        let len = self.entries.len();
        HistoryStatus {
            step: self.step,
            len,
            can_undo: self.step > 0,
            can_redo: self.step + 1 < len,
        }
    }
}

// =============================================================================
// RESTORE GUARD
// =============================================================================

/// Scoped suppression token. Exists only while a programmatic restore runs.
struct RestoreGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RestoreGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct HistoryEngine {
    canvas: Mutex<Option<Arc<dyn CanvasDocument>>>,
    stack: Mutex<HistoryStack>,
    restoring: AtomicBool,
    status: watch::Sender<HistoryStatus>,
}

impl Default for HistoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryEngine {
    /// An engine with no canvas bound. Every operation is a no-op until [`bind`](Self::bind).
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(HistoryStatus::default());
        Self {
            canvas: Mutex::new(None),
            stack: Mutex::new(HistoryStack::default()),
            restoring: AtomicBool::new(false),
            status,
        }
    }

    #[must_use]
    pub fn with_canvas(canvas: Arc<dyn CanvasDocument>) -> Self {
        let engine = Self::new();
        engine.bind(canvas);
        engine
    }

    /// Bind a canvas. History from a previous canvas is discarded.
    pub fn bind(&self, canvas: Arc<dyn CanvasDocument>) {
        *self.lock_canvas() = Some(canvas);
        self.clear();
    }

    /// Detach the canvas and discard history.
    pub fn unbind(&self) {
        *self.lock_canvas() = None;
        self.clear();
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.lock_canvas().is_some()
    }

    /// Seed the stack with the canvas as it is now. Call once the canvas has
    /// finished its own initial load; calling again resets all history.
    pub fn initialize(&self) -> bool {
        let Some(canvas) = self.canvas() else {
            return false;
        };
        let initial = canvas.snapshot();
        {
            let mut stack = self.lock_stack();
            stack.entries = vec![initial];
            stack.step = 0;
            stack.epoch = stack.epoch.wrapping_add(1);
        }
        debug!("history initialized");
        self.publish();
        true
    }

    /// Record the current canvas as a new step, dropping any redo branch.
    ///
    /// Returns false without touching the stack while a restore is running
    /// or when no canvas is bound.
    pub fn capture(&self) -> bool {
        if self.restoring.load(Ordering::Acquire) {
            return false;
        }
        let Some(canvas) = self.canvas() else {
            return false;
        };
        let snapshot = canvas.snapshot();
        {
            let mut stack = self.lock_stack();
            let keep = stack.step + 1;
            stack.entries.truncate(keep);
            stack.entries.push(snapshot);
            stack.step = stack.entries.len() - 1;
        }
        self.publish();
        true
    }

    pub async fn undo(&self) -> Navigation {
        self.navigate(|stack| if stack.step == 0 { Err(Navigation::AtBoundary) } else { Ok(stack.step - 1) })
            .await
    }

    pub async fn redo(&self) -> Navigation {
        self.navigate(|stack| {
            if stack.step + 1 >= stack.entries.len() { Err(Navigation::AtBoundary) } else { Ok(stack.step + 1) }
        })
        .await
    }

    /// Restore directly to `stack[step]` (history scrubber).
    pub async fn jump_to_step(&self, step: usize) -> Navigation {
        self.navigate(|stack| if step < stack.entries.len() { Ok(step) } else { Err(Navigation::OutOfRange) })
            .await
    }

    /// Run a keyboard-level command.
    pub async fn apply(&self, command: HistoryCommand) -> Navigation {
        match command {
            HistoryCommand::Undo => self.undo().await,
            HistoryCommand::Redo => self.redo().await,
        }
    }

    /// Discard the whole stack (document closed).
    pub fn clear(&self) {
        {
            let mut stack = self.lock_stack();
            stack.entries.clear();
            stack.step = 0;
            stack.epoch = stack.epoch.wrapping_add(1);
        }
        self.publish();
    }

    async fn navigate(&self, pick: impl FnOnce(&HistoryStack) -> Result<usize, Navigation>) -> Navigation {
        let Some(canvas) = self.canvas() else {
            return Navigation::Unbound;
        };
        let Some(_guard) = RestoreGuard::acquire(&self.restoring) else {
            return Navigation::Busy;
        };

        let (target, snapshot, epoch) = {
            let stack = self.lock_stack();
            match pick(&stack) {
                Ok(target) => (target, stack.entries[target].clone(), stack.epoch),
                Err(outcome) => return outcome,
            }
        };

        if let Err(e) = canvas.restore(&snapshot).await {
            warn!(error = %e, code = e.error_code(), step = target, "history restore failed");
            return Navigation::RestoreFailed;
        }
        canvas.render();

        {
            let mut stack = self.lock_stack();
            if stack.epoch != epoch {
                debug!(step = target, "history reset during restore");
                return Navigation::Superseded;
            }
            stack.step = target;
        }
        self.publish();
        Navigation::Moved { step: target }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn step(&self) -> usize {
        self.lock_stack().step
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_stack().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_stack().entries.is_empty()
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.status().can_undo
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.status().can_redo
    }

    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        self.lock_stack().status()
    }

    /// True while a programmatic restore holds the guard.
    #[must_use]
    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock_stack().entries.clone()
    }

    /// Snapshot at the cursor, if initialized.
    #[must_use]
    pub fn current(&self) -> Option<Snapshot> {
        let stack = self.lock_stack();
        stack.entries.get(stack.step).cloned()
    }

    /// Rows for the history panel, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        let stack = self.lock_stack();
        let total = stack.entries.len();
        (0..total)
            .map(|index| HistoryEntry {
                index,
                label: step_label(index, total),
                steps_ago: steps_ago(index, total),
                current: index == stack.step,
            })
            .collect()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<HistoryStatus> {
        self.status.subscribe()
    }

    fn publish(&self) {
        let status = self.status();
        self.status.send_replace(status);
    }

    fn canvas(&self) -> Option<Arc<dyn CanvasDocument>> {
        self.lock_canvas().clone()
    }

    fn lock_canvas(&self) -> MutexGuard<'_, Option<Arc<dyn CanvasDocument>>> {
        self.canvas.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_stack(&self) -> MutexGuard<'_, HistoryStack> {
        self.stack.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// =============================================================================
// LABELS
// =============================================================================

/// Panel label for entry `index` of a stack with `total` entries.
#[must_use]
pub fn step_label(index: usize, total: usize) -> String {
    if index == 0 {
        "Initial state".into()
    } else if index + 1 == total {
        "Latest change".into()
    } else {
        format!("Change {index}")
    }
}

/// Relative position of entry `index` from the tip.
#[must_use]
pub fn steps_ago(index: usize, total: usize) -> String {
    match total.saturating_sub(index + 1) {
        0 => "Now".into(),
        1 => "1 step ago".into(),
        n => format!("{n} steps ago"),
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
