//! Presence data model.
//!
//! One authoritative row per `(document_id, user_id)` lives in the store.
//! The engine only ever holds a derived, read-only [`PresenceView`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Cursor location in canvas container coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Upsert key for a presence row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    pub document_id: Uuid,
    pub user_id: Uuid,
}

/// A live collaborator as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub cursor_position: Option<CursorPosition>,
    pub last_seen: OffsetDateTime,
}

/// A presence row exactly as the store holds it. `user_id` is nullable in
/// the backing table; the engine drops such rows.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPresence {
    pub document_id: Uuid,
    pub user_id: Option<Uuid>,
    pub cursor_position: Option<CursorPosition>,
    pub last_seen: OffsetDateTime,
}

/// How an upsert treats the cursor column.
///
/// `Unchanged` keeps whatever the row already has (null for a new row), so
/// joins and heartbeats never clobber a cursor written by `update_presence`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CursorField {
    Unchanged,
    Set(Option<CursorPosition>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceUpsert {
    pub key: PresenceKey,
    pub last_seen: OffsetDateTime,
    pub cursor: CursorField,
}

/// Server-side filter for the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceFilter {
    pub document_id: Uuid,
    /// Inclusive lower bound on `last_seen`.
    pub seen_since: OffsetDateTime,
}

impl PresenceFilter {
    #[must_use]
    pub fn matches(&self, row: &StoredPresence) -> bool {
        row.document_id == self.document_id && row.last_seen >= self.seen_since
    }
}

// =============================================================================
// COLLABORATOR COLORS
// =============================================================================

pub const COLLABORATOR_COLORS: [&str; 10] = [
    "#EF4444", "#3B82F6", "#22C55E", "#F59E0B", "#A855F7", "#EC4899", "#14B8A6", "#F97316", "#8B5CF6", "#06B6D4",
];

/// Stable cursor color for a user.
#[must_use]
pub fn collaborator_color(user_id: Uuid) -> &'static str {
    let index = usize::from(user_id.as_bytes()[0]) % COLLABORATOR_COLORS.len();
    COLLABORATOR_COLORS[index]
}

/// A presence record decorated for display.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub cursor_position: Option<CursorPosition>,
    pub last_seen: OffsetDateTime,
    pub color: &'static str,
}

impl From<&PresenceRecord> for Collaborator {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id,
            cursor_position: record.cursor_position,
            last_seen: record.last_seen,
            color: collaborator_color(record.user_id),
        }
    }
}

// =============================================================================
// VIEW
// =============================================================================

/// Point-in-time set of live collaborators. Replaced wholesale on every
/// completed fetch and never aged locally between fetches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    pub document_id: Option<Uuid>,
    /// When the fetch that produced this view was issued.
    pub fetched_at: Option<OffsetDateTime>,
    pub records: HashMap<Uuid, PresenceRecord>,
}

impl PresenceView {
    #[must_use]
    pub fn empty(document_id: Uuid) -> Self {
        Self { document_id: Some(document_id), fetched_at: None, records: HashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.records.contains_key(&user_id)
    }

    /// Collaborators ordered by user id, so repeated renders are stable.
    #[must_use]
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut out: Vec<Collaborator> = self.records.values().map(Collaborator::from).collect();
        out.sort_by_key(|c| c.user_id);
        out
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
