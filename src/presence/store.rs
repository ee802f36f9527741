//! Remote store seam: query / upsert / delete / subscribe.
//!
//! The store is shared by every collaborator and has no client-side locking;
//! upserts are last-writer-wins per field. Change events are invalidation
//! signals only. They carry no row data because the feed may omit
//! expiry and partial payloads.

use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::{PresenceFilter, PresenceKey, PresenceUpsert, StoredPresence};
use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("change feed closed")]
    Closed,
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "E_STORE_BACKEND",
            Self::Database(_) => "E_DATABASE",
            Self::Closed => "E_FEED_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// "Something changed for this document."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub document_id: Uuid,
}

/// An open change feed. Dropping `events` without unsubscribing leaks the
/// store-side channel until the store notices the closed receiver.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    /// All rows for `filter.document_id` with `last_seen >= filter.seen_since`.
    async fn query(&self, filter: PresenceFilter) -> Result<Vec<StoredPresence>, StoreError>;

    /// Insert or update the row for `upsert.key`.
    async fn upsert(&self, upsert: PresenceUpsert) -> Result<(), StoreError>;

    async fn delete(&self, key: PresenceKey) -> Result<(), StoreError>;

    /// Open a change feed scoped to one document.
    async fn subscribe(&self, document_id: Uuid) -> Result<Subscription, StoreError>;

    /// Close a feed. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError>;
}
