//! In-memory presence store.
//!
//! Behaves like the Postgres store (upsert key, inclusive freshness filter,
//! per-document change fan-out) and adds knobs the real backend cannot
//! offer: scripted query latency, one-shot failure injection, and call
//! counters. Query results are computed when the call is issued and
//! delivered after the scripted delay, which is how a slow network
//! response to an older request looks from the client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::store::{ChangeEvent, PresenceStore, StoreError, Subscription, SubscriptionId};
use super::types::{CursorField, PresenceFilter, PresenceKey, PresenceUpsert, StoredPresence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Query,
    Upsert,
    Delete,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub query: usize,
    pub upsert: usize,
    pub delete: usize,
    pub subscribe: usize,
    pub unsubscribe: usize,
}

#[derive(Default)]
struct MemoryInner {
    rows: Vec<StoredPresence>,
    subscribers: HashMap<SubscriptionId, (Uuid, mpsc::UnboundedSender<ChangeEvent>)>,
    query_delays: VecDeque<Duration>,
    failures: HashMap<StoreOp, usize>,
    calls: CallCounts,
}

impl MemoryInner {
    fn record(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match op {
            StoreOp::Query => self.calls.query += 1,
            StoreOp::Upsert => self.calls.upsert += 1,
            StoreOp::Delete => self.calls.delete += 1,
            StoreOp::Subscribe => self.calls.subscribe += 1,
            StoreOp::Unsubscribe => self.calls.unsubscribe += 1,
        }
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Backend(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, document_id: Uuid) {
        self.subscribers
            .retain(|_, (doc, tx)| *doc != document_id || tx.send(ChangeEvent { document_id }).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    inner: Mutex<MemoryInner>,
    next_subscription: AtomicU64,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay the next unclaimed query by `delay`. Delays are consumed in issue order.
    pub fn push_query_delay(&self, delay: Duration) {
        self.lock().query_delays.push_back(delay);
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: StoreOp) {
        *self.lock().failures.entry(op).or_insert(0) += 1;
    }

    /// Insert a row verbatim (including null users) and fire the feed.
    pub fn insert_raw(&self, row: StoredPresence) {
        let mut inner = self.lock();
        let document_id = row.document_id;
        inner.rows.push(row);
        inner.broadcast(document_id);
    }

    /// Fire the feed for `document_id` without changing any data.
    pub fn touch(&self, document_id: Uuid) {
        self.lock().broadcast(document_id);
    }

    /// Drop every subscriber's sender, closing all feeds.
    pub fn close_feeds(&self) {
        self.lock().subscribers.clear();
    }

    #[must_use]
    pub fn rows(&self) -> Vec<StoredPresence> {
        self.lock().rows.clone()
    }

    #[must_use]
    pub fn row(&self, key: PresenceKey) -> Option<StoredPresence> {
        self.lock()
            .rows
            .iter()
            .find(|r| r.document_id == key.document_id && r.user_id == Some(key.user_id))
            .cloned()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn query(&self, filter: PresenceFilter) -> Result<Vec<StoredPresence>, StoreError> {
        let (rows, delay) = {
            let mut inner = self.lock();
            inner.record(StoreOp::Query)?;
            let rows: Vec<StoredPresence> = inner.rows.iter().filter(|r| filter.matches(r)).cloned().collect();
            (rows, inner.query_delays.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn upsert(&self, upsert: PresenceUpsert) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(StoreOp::Upsert)?;
        let PresenceKey { document_id, user_id } = upsert.key;

        let existing = inner
            .rows
            .iter_mut()
            .find(|r| r.document_id == document_id && r.user_id == Some(user_id));
        match existing {
            Some(row) => {
                row.last_seen = upsert.last_seen;
                if let CursorField::Set(cursor) = upsert.cursor {
                    row.cursor_position = cursor;
                }
            }
            None => {
                let cursor_position = match upsert.cursor {
                    CursorField::Set(cursor) => cursor,
                    CursorField::Unchanged => None,
                };
                inner.rows.push(StoredPresence {
                    document_id,
                    user_id: Some(user_id),
                    cursor_position,
                    last_seen: upsert.last_seen,
                });
            }
        }
        inner.broadcast(document_id);
        Ok(())
    }

    async fn delete(&self, key: PresenceKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(StoreOp::Delete)?;
        let before = inner.rows.len();
        inner
            .rows
            .retain(|r| !(r.document_id == key.document_id && r.user_id == Some(key.user_id)));
        if inner.rows.len() != before {
            inner.broadcast(key.document_id);
        }
        Ok(())
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        inner.record(StoreOp::Subscribe)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        inner.subscribers.insert(id, (document_id, tx));
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(StoreOp::Unsubscribe)?;
        inner.subscribers.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
