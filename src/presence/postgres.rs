//! Postgres-backed presence store over the `collaboration_sessions` table.
//!
//! DESIGN
//! ======
//! Rows are keyed by `(diagram_id, user_id)`. A row trigger calls
//! `pg_notify('collaboration_sessions', diagram_id)` on every insert, update
//! and delete; each subscription owns a `PgListener` task that forwards
//! notifications for its document and drops the rest.
//!
//! `PgListener` reconnects on the next `recv` after a connection error, so a
//! failed `recv` is retried with a growing delay. The feed only closes after
//! `MAX_LISTEN_RETRIES` consecutive failures.
//!
//! The cursor column is free-form JSONB written by other clients too, so a
//! value that does not decode as a cursor is read as "no cursor" rather than
//! failing the whole query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::{ChangeEvent, PresenceStore, StoreError, Subscription, SubscriptionId};
use super::types::{CursorField, CursorPosition, PresenceFilter, PresenceKey, PresenceUpsert, StoredPresence};

/// `LISTEN` channel the table trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "collaboration_sessions";

/// Consecutive `recv` failures tolerated before the feed is closed.
pub const MAX_LISTEN_RETRIES: u32 = 5;
const LISTEN_RETRY_BASE_MS: u64 = 500;

pub struct PgPresenceStore {
    pool: PgPool,
    listeners: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
}

impl PgPresenceStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool, listeners: Mutex::new(HashMap::new()), next_subscription: AtomicU64::new(1) }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn lock_listeners(&self) -> MutexGuard<'_, HashMap<SubscriptionId, JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for PgPresenceStore {
    fn drop(&mut self) {
        for (_, task) in self.lock_listeners().drain() {
            task.abort();
        }
    }
}

/// Document id carried by a trigger notification, if well-formed.
pub(crate) fn parse_notification(payload: &str) -> Option<Uuid> {
    Uuid::parse_str(payload.trim()).ok()
}

/// Delay before retrying after the `failures`-th consecutive `recv` error,
/// or `None` once the listener should give up.
pub(crate) fn listen_retry_delay(failures: u32) -> Option<Duration> {
    if failures == 0 || failures > MAX_LISTEN_RETRIES {
        return None;
    }
    Some(Duration::from_millis(LISTEN_RETRY_BASE_MS * u64::from(failures)))
}

/// Decode the JSONB cursor column, treating anything unexpected as absent.
pub(crate) fn cursor_from_json(value: Option<serde_json::Value>) -> Option<CursorPosition> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

#[async_trait::async_trait]
impl PresenceStore for PgPresenceStore {
    async fn query(&self, filter: PresenceFilter) -> Result<Vec<StoredPresence>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Option<Uuid>, Option<serde_json::Value>, OffsetDateTime)>(
            "SELECT diagram_id, user_id, cursor_position, last_seen \
             FROM collaboration_sessions \
             WHERE diagram_id = $1 AND last_seen >= $2",
        )
        .bind(filter.document_id)
        .bind(filter.seen_since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(document_id, user_id, cursor, last_seen)| StoredPresence {
                document_id,
                user_id,
                cursor_position: cursor_from_json(cursor),
                last_seen,
            })
            .collect())
    }

    async fn upsert(&self, upsert: PresenceUpsert) -> Result<(), StoreError> {
        let (set_cursor, cursor) = match upsert.cursor {
            CursorField::Unchanged => (false, None),
            CursorField::Set(cursor) => (true, cursor),
        };
        sqlx::query(
            "INSERT INTO collaboration_sessions (diagram_id, user_id, cursor_position, last_seen) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (diagram_id, user_id) DO UPDATE SET \
                 last_seen = EXCLUDED.last_seen, \
                 cursor_position = CASE WHEN $5 THEN EXCLUDED.cursor_position \
                                        ELSE collaboration_sessions.cursor_position END",
        )
        .bind(upsert.key.document_id)
        .bind(upsert.key.user_id)
        .bind(cursor.map(Json))
        .bind(upsert.last_seen)
        .bind(set_cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: PresenceKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM collaboration_sessions WHERE diagram_id = $1 AND user_id = $2")
            .bind(key.document_id)
            .bind(key.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<Subscription, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut failures = 0;
            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            failures = 0;
                            if parse_notification(notification.payload()) != Some(document_id) {
                                continue;
                            }
                            if tx.send(ChangeEvent { document_id }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            let Some(delay) = listen_retry_delay(failures) else {
                                warn!(%document_id, error = %e, failures, "presence listener giving up; closing feed");
                                break;
                            };
                            warn!(%document_id, error = %e, failures, "presence listener error; retrying");
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = tx.closed() => break,
                            }
                        }
                    },
                    () = tx.closed() => break,
                }
            }
            debug!(%document_id, subscription = id.0, "presence listener stopped");
        });

        self.lock_listeners().insert(id, task);
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        if let Some(task) = self.lock_listeners().remove(&id) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
