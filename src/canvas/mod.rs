//! Canvas document seam.
//!
//! DESIGN
//! ======
//! The history engine only needs three things from a canvas: serialize the
//! whole document, load it back, and redraw. Everything else (shapes,
//! selection, hit testing) stays behind [`CanvasDocument`].
//!
//! Implementations must fire their "changed" notification after every
//! mutation, including mutations caused by [`CanvasDocument::restore`]. The
//! history engine relies on its own restore guard, not on the canvas, to
//! keep replays out of the stack.

pub mod scene;

use std::fmt;
use std::sync::Arc;

use crate::error::ErrorCode;

pub use scene::{ListenerId, ObjectKind, SceneCanvas, SceneObject};

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Opaque serialized whole-document state. Cheap to clone, immutable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Snapshot(Arc<str>);

impl Snapshot {
    #[must_use]
    pub fn new(serialized: impl Into<Arc<str>>) -> Self {
        Self(serialized.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Snapshots can be large; show a prefix only.
        let preview: String = self.0.chars().take(48).collect();
        f.debug_tuple("Snapshot").field(&preview).finish()
    }
}

impl From<String> for Snapshot {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Snapshot {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("canvas rejected state: {0}")]
    Rejected(String),
}

impl ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedSnapshot(_) => "E_MALFORMED_SNAPSHOT",
            Self::Rejected(_) => "E_CANVAS_REJECTED",
        }
    }
}

// =============================================================================
// DOCUMENT TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait CanvasDocument: Send + Sync {
    /// Serialize the entire document as it is right now.
    fn snapshot(&self) -> Snapshot;

    /// Replace the document with `snapshot`. May suspend while the canvas loads.
    async fn restore(&self, snapshot: &Snapshot) -> Result<(), CanvasError>;

    /// Redraw after a programmatic change.
    fn render(&self);
}
