//! Presence engine: who else is on this document right now.
//!
//! DESIGN
//! ======
//! The engine subscribes to the store's change feed for one document and
//! treats every event purely as "something changed": it re-queries the full
//! active set and replaces its [`PresenceView`] wholesale. Deltas from the
//! feed are never applied, because the feed does not report rows that age
//! out of the freshness window and may deliver partial payloads.
//!
//! Freshness is evaluated once per fetch, against the instant the fetch was
//! issued, and that instant travels with the view as `fetched_at`. The view
//! is not re-aged between fetches, so a collaborator who stops heartbeating
//! stays visible until the next invalidation.
//!
//! LIFECYCLE
//! =========
//! `Unbound -> Subscribing -> Active -> Unbound`. `subscribe` tears down any
//! previous feed first. `teardown` aborts the listener task before its first
//! await, so no fetch spawned by the old feed can touch the view afterwards;
//! dropping the engine does the same.
//!
//! Every `subscribe` and `teardown` bumps the binding generation. A
//! `subscribe` that finds a different generation after one of its awaits has
//! been superseded and releases whatever it opened.
//!
//! If the store closes the feed, the engine moves to `Disconnected`: the
//! document stays bound and the view keeps its last contents, but nothing
//! invalidates it any more until the host calls `subscribe` again.
//!
//! ERROR HANDLING
//! ==============
//! Remote failures are reported through the [`Notifier`] and never returned
//! to the caller. There is no error state: the engine stays usable and
//! recovers on the next change event or explicit call.

pub mod identity;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_FRESHNESS_SECS;
use crate::error::ErrorCode;
use crate::notify::{Notice, Notifier, TracingNotifier};

pub use identity::{CurrentUser, IdentityProvider, StaticIdentity};
pub use memory::MemoryPresenceStore;
pub use postgres::PgPresenceStore;
pub use store::{ChangeEvent, PresenceStore, StoreError, Subscription, SubscriptionId};
pub use types::{
    Collaborator, CursorField, CursorPosition, PresenceFilter, PresenceKey, PresenceRecord, PresenceUpsert,
    PresenceView, StoredPresence, collaborator_color,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresencePhase {
    #[default]
    Unbound,
    Subscribing,
    Active,
    /// The change feed closed underneath an active subscription.
    Disconnected,
}

struct ActiveFeed {
    id: SubscriptionId,
    listener: JoinHandle<()>,
}

#[derive(Default)]
struct Binding {
    generation: u64,
    phase: PresencePhase,
    document_id: Option<Uuid>,
    feed: Option<ActiveFeed>,
    heartbeat: Option<JoinHandle<()>>,
}

struct Shared {
    store: Arc<dyn PresenceStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    binding: Mutex<Binding>,
    view: watch::Sender<PresenceView>,
}

// =============================================================================
// BUILDER
// =============================================================================

pub struct PresenceEngineBuilder {
    store: Arc<dyn PresenceStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
}

impl PresenceEngineBuilder {
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records older than `freshness` at fetch time are not live.
    #[must_use]
    pub fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    #[must_use]
    pub fn build(self) -> PresenceEngine {
        let (view, _) = watch::channel(PresenceView::default());
        PresenceEngine {
            shared: Arc::new(Shared {
                store: self.store,
                identity: self.identity,
                notifier: self.notifier,
                clock: self.clock,
                freshness: self.freshness,
                binding: Mutex::new(Binding::default()),
                view,
            }),
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct PresenceEngine {
    shared: Arc<Shared>,
}

impl PresenceEngine {
    /// Start building an engine. Defaults: system clock, tracing notifier,
    /// five-minute freshness window.
    #[must_use]
    pub fn builder(store: Arc<dyn PresenceStore>, identity: Arc<dyn IdentityProvider>) -> PresenceEngineBuilder {
        PresenceEngineBuilder {
            store,
            identity,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
        }
    }

    /// Open the change feed for `document_id` and populate the view.
    ///
    /// Any previous feed is torn down first. Returns the resulting phase:
    /// `Active` on success, `Unbound` if the feed could not be opened or a
    /// later `subscribe`/`teardown` overtook this one.
    pub async fn subscribe(&self, document_id: Uuid) -> PresencePhase {
        let reconnecting = self.phase() == PresencePhase::Disconnected;
        self.teardown().await;
        let shared = &self.shared;

        let generation = {
            let mut binding = shared.lock_binding();
            binding.generation = binding.generation.wrapping_add(1);
            binding.phase = PresencePhase::Subscribing;
            binding.document_id = Some(document_id);
            binding.generation
        };
        shared.view.send_replace(PresenceView::empty(document_id));

        let subscription = match shared.store.subscribe(document_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(%document_id, error = %e, code = e.error_code(), "presence subscribe failed");
                shared.notifier.notify(Notice::error("Failed to connect to collaboration"));
                let mut binding = shared.lock_binding();
                if binding.generation == generation {
                    binding.phase = PresencePhase::Unbound;
                    binding.document_id = None;
                }
                return PresencePhase::Unbound;
            }
        };

        let Subscription { id, events } = subscription;
        let listener = tokio::spawn(run_listener(Arc::clone(shared), document_id, generation, events));
        let superseded = {
            let mut binding = shared.lock_binding();
            if binding.generation == generation && binding.phase == PresencePhase::Subscribing {
                binding.feed = Some(ActiveFeed { id, listener });
                None
            } else {
                listener.abort();
                Some(id)
            }
        };
        if let Some(id) = superseded {
            // Torn down or resubscribed while the feed was opening.
            shared.release_feed(id).await;
            return shared.lock_binding().phase;
        }

        shared.refresh(document_id).await;

        let phase = {
            let mut binding = shared.lock_binding();
            if binding.generation != generation {
                return binding.phase;
            }
            if binding.phase == PresencePhase::Subscribing {
                binding.phase = PresencePhase::Active;
                info!(%document_id, subscription = id.0, "presence active");
            }
            binding.phase
        };
        if reconnecting && phase == PresencePhase::Active {
            shared.notifier.notify(Notice::info("Reconnected to collaboration"));
        }
        phase
    }

    /// Query the store for live collaborators on `document_id`.
    ///
    /// Excludes rows without a user, rows for the local user, and rows whose
    /// `last_seen` is older than the freshness window at fetch time. Does
    /// not touch the engine's view.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    pub async fn fetch_active(&self, document_id: Uuid) -> Result<PresenceView, PresenceError> {
        let fetched_at = self.shared.clock.now();
        self.shared.fetch_active_at(document_id, fetched_at).await
    }

    /// Re-fetch and replace the view if the engine is still bound to
    /// `document_id`. Returns whether the view was replaced.
    pub async fn refresh(&self, document_id: Uuid) -> bool {
        self.shared.refresh(document_id).await
    }

    /// Advertise the local user on `document_id`. No-op when signed out.
    pub async fn join(&self, document_id: Uuid) -> bool {
        self.shared
            .upsert_self(document_id, CursorField::Unchanged, "Failed to join collaboration")
            .await
    }

    /// Advertise the local user's cursor. Callers throttle; the engine does not.
    pub async fn update_presence(&self, document_id: Uuid, cursor_position: Option<CursorPosition>) -> bool {
        self.shared
            .upsert_self(document_id, CursorField::Set(cursor_position), "Failed to update presence")
            .await
    }

    /// Remove the local user's record. Best effort, never retried.
    pub async fn leave(&self, document_id: Uuid) -> bool {
        let shared = &self.shared;
        let Some(user) = shared.identity.current_user().await else {
            return false;
        };
        let key = PresenceKey { document_id, user_id: user.user_id };
        match shared.store.delete(key).await {
            Ok(()) => {
                debug!(%document_id, user_id = %user.user_id, "presence left");
                true
            }
            Err(e) => {
                warn!(%document_id, error = %e, code = e.error_code(), "presence leave failed");
                shared.notifier.notify(Notice::error("Failed to leave collaboration"));
                false
            }
        }
    }

    /// Re-upsert `last_seen` every `interval` until teardown. Replaces any
    /// running heartbeat. The first beat fires one interval from now.
    pub fn spawn_heartbeat(&self, document_id: Uuid, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                shared
                    .upsert_self(document_id, CursorField::Unchanged, "Lost connection to collaboration")
                    .await;
            }
        });
        if let Some(previous) = self.shared.lock_binding().heartbeat.replace(task) {
            previous.abort();
        }
    }

    /// Cancel the change feed and heartbeat. Idempotent: with nothing
    /// subscribed this does nothing, and a feed is never cancelled twice.
    /// Also abandons any `subscribe` still in flight.
    pub async fn teardown(&self) {
        let shared = &self.shared;
        let (feed, document_id) = {
            let mut binding = shared.lock_binding();
            if let Some(heartbeat) = binding.heartbeat.take() {
                heartbeat.abort();
            }
            let feed = binding.feed.take();
            if let Some(feed) = &feed {
                feed.listener.abort();
            }
            let document_id = binding.document_id.take();
            binding.generation = binding.generation.wrapping_add(1);
            binding.phase = PresencePhase::Unbound;
            (feed, document_id)
        };
        if document_id.is_some() {
            shared.view.send_replace(PresenceView::default());
        }
        if let Some(feed) = feed {
            shared.release_feed(feed.id).await;
            info!(document_id = ?document_id, subscription = feed.id.0, "presence torn down");
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn phase(&self) -> PresencePhase {
        self.shared.lock_binding().phase
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase() == PresencePhase::Active
    }

    #[must_use]
    pub fn document_id(&self) -> Option<Uuid> {
        self.shared.lock_binding().document_id
    }

    #[must_use]
    pub fn view(&self) -> PresenceView {
        self.shared.view.borrow().clone()
    }

    #[must_use]
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.shared.view.borrow().collaborators()
    }

    /// Subscribe to view replacements.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PresenceView> {
        self.shared.view.subscribe()
    }
}

impl Drop for PresenceEngine {
    fn drop(&mut self) {
        let feed = {
            let mut binding = self.shared.lock_binding();
            if let Some(heartbeat) = binding.heartbeat.take() {
                heartbeat.abort();
            }
            binding.feed.take()
        };
        let Some(feed) = feed else {
            return;
        };
        feed.listener.abort();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.shared.store);
            handle.spawn(async move {
                if let Err(e) = store.unsubscribe(feed.id).await {
                    warn!(error = %e, subscription = feed.id.0, "presence unsubscribe on drop failed");
                }
            });
        }
    }
}

// =============================================================================
// SHARED
// =============================================================================

impl Shared {
    async fn fetch_active_at(
        &self,
        document_id: Uuid,
        fetched_at: OffsetDateTime,
    ) -> Result<PresenceView, PresenceError> {
        let filter = PresenceFilter { document_id, seen_since: fetched_at - self.freshness };
        let rows = self.store.query(filter).await?;
        let me = self.identity.current_user().await.map(|u| u.user_id);

        let mut records: HashMap<Uuid, PresenceRecord> = HashMap::with_capacity(rows.len());
        for row in rows {
            if !filter.matches(&row) {
                continue;
            }
            let Some(user_id) = row.user_id else {
                continue;
            };
            if Some(user_id) == me {
                continue;
            }
            let record = PresenceRecord { user_id, cursor_position: row.cursor_position, last_seen: row.last_seen };
            match records.get(&user_id) {
                Some(existing) if existing.last_seen >= record.last_seen => {}
                _ => {
                    records.insert(user_id, record);
                }
            }
        }

        Ok(PresenceView { document_id: Some(document_id), fetched_at: Some(fetched_at), records })
    }

    async fn refresh(&self, document_id: Uuid) -> bool {
        let fetched_at = self.clock.now();
        match self.fetch_active_at(document_id, fetched_at).await {
            Ok(view) => {
                // Completion order decides: whichever fetch lands last wins.
                if self.lock_binding().document_id != Some(document_id) {
                    return false;
                }
                debug!(%document_id, collaborators = view.len(), "presence view replaced");
                self.view.send_replace(view);
                true
            }
            Err(e) => {
                warn!(%document_id, error = %e, code = e.error_code(), "presence fetch failed");
                self.notifier.notify(Notice::error("Failed to load collaborators"));
                false
            }
        }
    }

    async fn upsert_self(&self, document_id: Uuid, cursor: CursorField, failure: &str) -> bool {
        let Some(user) = self.identity.current_user().await else {
            return false;
        };
        let upsert = PresenceUpsert {
            key: PresenceKey { document_id, user_id: user.user_id },
            last_seen: self.clock.now(),
            cursor,
        };
        match self.store.upsert(upsert).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%document_id, error = %e, code = e.error_code(), "presence upsert failed");
                self.notifier.notify(Notice::error(failure));
                false
            }
        }
    }

    /// The store ended the feed on its own. Aborted listeners never get here.
    async fn feed_closed(&self, document_id: Uuid, generation: u64) {
        let feed = {
            let mut binding = self.lock_binding();
            if binding.generation != generation {
                return;
            }
            binding.phase = PresencePhase::Disconnected;
            binding.feed.take()
        };
        warn!(%document_id, "presence feed closed");
        self.notifier.notify(Notice::error("Lost connection to collaboration"));
        // The listener being released is this task; drop its handle, don't abort it.
        if let Some(feed) = feed {
            self.release_feed(feed.id).await;
        }
    }

    async fn release_feed(&self, id: SubscriptionId) {
        if let Err(e) = self.store.unsubscribe(id).await {
            warn!(error = %e, subscription = id.0, "presence unsubscribe failed");
        }
    }

    fn lock_binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Turn feed events into full re-fetches until the feed closes or the task
/// is aborted. Aborting drops the `JoinSet`, which aborts in-flight fetches.
async fn run_listener(
    shared: Arc<Shared>,
    document_id: Uuid,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let mut fetches = JoinSet::new();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                debug!(document_id = %event.document_id, "presence change; refetching");
                let shared = Arc::clone(&shared);
                fetches.spawn(async move {
                    shared.refresh(document_id).await;
                });
            }
            Some(_) = fetches.join_next(), if !fetches.is_empty() => {}
        }
    }
    while fetches.join_next().await.is_some() {}
    shared.feed_closed(document_id, generation).await;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
