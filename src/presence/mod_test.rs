use time::macros::datetime;
use tokio::time::timeout;

use super::*;
use crate::clock::ManualClock;
use crate::notify::{NoticeLevel, RecordingNotifier};
use crate::presence::memory::StoreOp;

const T0: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

// =============================================================================
// HARNESS
// =============================================================================

struct Harness {
    store: Arc<MemoryPresenceStore>,
    identity: Arc<StaticIdentity>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
    engine: PresenceEngine,
    me: Uuid,
    doc: Uuid,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryPresenceStore::new());
    let me = Uuid::new_v4();
    let identity = Arc::new(StaticIdentity::signed_in(me));
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(ManualClock::new(T0));
    let engine = PresenceEngine::builder(store.clone(), identity.clone())
        .notifier(notifier.clone())
        .clock(clock.clone())
        .build();
    Harness { store, identity, notifier, clock, engine, me, doc: Uuid::new_v4() }
}

fn row(document_id: Uuid, user_id: Option<Uuid>, last_seen: OffsetDateTime) -> StoredPresence {
    StoredPresence { document_id, user_id, cursor_position: None, last_seen }
}

async fn seen_by(store: &MemoryPresenceStore, document_id: Uuid, user_id: Uuid, last_seen: OffsetDateTime) {
    store
        .upsert(PresenceUpsert { key: PresenceKey { document_id, user_id }, last_seen, cursor: CursorField::Unchanged })
        .await
        .unwrap();
}

/// Delegates to the memory store but takes `delay` to open a feed.
struct SlowSubscribe {
    inner: Arc<MemoryPresenceStore>,
    delay: Duration,
}

#[async_trait::async_trait]
impl PresenceStore for SlowSubscribe {
    async fn query(&self, filter: PresenceFilter) -> Result<Vec<StoredPresence>, StoreError> {
        self.inner.query(filter).await
    }

    async fn upsert(&self, upsert: PresenceUpsert) -> Result<(), StoreError> {
        self.inner.upsert(upsert).await
    }

    async fn delete(&self, key: PresenceKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<Subscription, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.subscribe(document_id).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.inner.unsubscribe(id).await
    }
}

fn slow_engine(store: &Arc<MemoryPresenceStore>) -> PresenceEngine {
    let slow = Arc::new(SlowSubscribe { inner: Arc::clone(store), delay: Duration::from_millis(10) });
    PresenceEngine::builder(slow, Arc::new(StaticIdentity::signed_in(Uuid::new_v4())))
        .notifier(Arc::new(RecordingNotifier::new()))
        .clock(Arc::new(ManualClock::new(T0)))
        .build()
}

async fn settle_unsubscribes(store: &MemoryPresenceStore, expected: usize) {
    for _ in 0..20 {
        if store.calls().unsubscribe >= expected {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn next_view(rx: &mut watch::Receiver<PresenceView>) -> PresenceView {
    timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("view update timed out")
        .expect("engine dropped");
    rx.borrow_and_update().clone()
}

// =============================================================================
// subscribe / fetch
// =============================================================================

#[tokio::test]
async fn subscribe_populates_view_immediately() {
    let h = harness();
    let other = Uuid::new_v4();
    seen_by(&h.store, h.doc, other, T0).await;

    assert_eq!(h.engine.phase(), PresencePhase::Unbound);
    assert_eq!(h.engine.subscribe(h.doc).await, PresencePhase::Active);

    assert!(h.engine.is_connected());
    assert_eq!(h.engine.document_id(), Some(h.doc));
    let view = h.engine.view();
    assert!(view.contains(other));
    assert_eq!(view.fetched_at, Some(T0));
    assert_eq!(h.store.subscriber_count(), 1);
}

#[tokio::test]
async fn view_never_contains_local_user() {
    let h = harness();
    let other = Uuid::new_v4();
    h.engine.subscribe(h.doc).await;

    assert!(h.engine.join(h.doc).await);
    seen_by(&h.store, h.doc, other, T0).await;
    h.engine.refresh(h.doc).await;

    let view = h.engine.view();
    assert!(!view.contains(h.me));
    assert!(view.contains(other));
    assert_eq!(view.len(), 1);
    assert_eq!(h.store.rows().len(), 2);
}

#[tokio::test]
async fn fetch_active_applies_freshness_window_and_drops_null_users() {
    let h = harness();
    let fresh = Uuid::new_v4();
    let boundary = Uuid::new_v4();
    let stale = Uuid::new_v4();
    h.store.insert_raw(row(h.doc, Some(fresh), T0 - time::Duration::seconds(30)));
    h.store.insert_raw(row(h.doc, Some(boundary), T0 - time::Duration::minutes(5)));
    h.store.insert_raw(row(h.doc, Some(stale), T0 - time::Duration::seconds(301)));
    h.store.insert_raw(row(h.doc, None, T0));
    h.store.insert_raw(row(Uuid::new_v4(), Some(Uuid::new_v4()), T0));

    let view = h.engine.fetch_active(h.doc).await.unwrap();

    assert!(view.contains(fresh));
    assert!(view.contains(boundary));
    assert!(!view.contains(stale));
    assert_eq!(view.len(), 2);
    assert_eq!(view.fetched_at, Some(T0));
}

#[tokio::test]
async fn fetch_active_does_not_touch_the_view() {
    let h = harness();
    seen_by(&h.store, h.doc, Uuid::new_v4(), T0).await;

    let fetched = h.engine.fetch_active(h.doc).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert!(h.engine.view().is_empty());
}

#[tokio::test]
async fn view_is_not_aged_between_fetches() {
    let h = harness();
    let other = Uuid::new_v4();
    seen_by(&h.store, h.doc, other, T0).await;
    h.engine.subscribe(h.doc).await;

    h.clock.advance(time::Duration::minutes(10));
    assert!(h.engine.view().contains(other));

    h.engine.refresh(h.doc).await;
    let view = h.engine.view();
    assert!(!view.contains(other));
    assert_eq!(view.fetched_at, Some(T0 + time::Duration::minutes(10)));
}

#[tokio::test]
async fn change_feed_triggers_full_refetch() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    let mut rx = h.engine.watch();
    let queries_before = h.store.calls().query;

    let other = Uuid::new_v4();
    seen_by(&h.store, h.doc, other, T0).await;

    let view = next_view(&mut rx).await;
    assert!(view.contains(other));
    assert!(h.store.calls().query > queries_before);
}

#[tokio::test]
async fn feed_event_without_data_change_still_refetches() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    let mut rx = h.engine.watch();
    h.store.insert_raw(row(h.doc, Some(Uuid::new_v4()), T0));
    next_view(&mut rx).await;
    let queries = h.store.calls().query;

    h.store.touch(h.doc);
    next_view(&mut rx).await;
    assert_eq!(h.store.calls().query, queries + 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_fetches_last_completion_wins() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    // With the feed closed only the explicit refreshes below query the store.
    // A disconnected engine still applies them.
    h.store.close_feeds();
    settle_unsubscribes(&h.store, 1).await;

    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    h.store.insert_raw(row(h.doc, Some(a), T0));
    h.store.push_query_delay(Duration::from_millis(100));
    h.store.push_query_delay(Duration::from_millis(10));

    let mut rx = h.engine.watch();
    let (first, second) = tokio::join!(h.engine.refresh(h.doc), async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.store.insert_raw(row(h.doc, Some(b), T0));
        let applied = h.engine.refresh(h.doc).await;
        // The later-issued fetch lands first.
        let view = rx.borrow_and_update().clone();
        assert!(view.contains(a) && view.contains(b));
        applied
    });

    assert!(first);
    assert!(second);
    let view = h.engine.view();
    assert!(view.contains(a));
    assert!(!view.contains(b));
}

// =============================================================================
// join / update / leave
// =============================================================================

#[tokio::test]
async fn join_is_noop_when_signed_out() {
    let h = harness();
    h.identity.set(None);

    assert!(!h.engine.join(h.doc).await);
    assert!(!h.engine.update_presence(h.doc, Some(CursorPosition::new(1.0, 1.0))).await);
    assert!(!h.engine.leave(h.doc).await);
    assert_eq!(h.store.calls().upsert, 0);
    assert_eq!(h.store.calls().delete, 0);
}

#[tokio::test]
async fn join_failure_is_reported_not_returned() {
    let h = harness();
    h.store.fail_next(StoreOp::Upsert);

    assert!(!h.engine.join(h.doc).await);
    assert_eq!(h.notifier.errors(), vec!["Failed to join collaboration".to_string()]);

    assert!(h.engine.join(h.doc).await);
}

#[tokio::test]
async fn update_presence_sets_cursor_and_join_keeps_it() {
    let h = harness();
    let key = PresenceKey { document_id: h.doc, user_id: h.me };

    h.engine.join(h.doc).await;
    assert_eq!(h.store.row(key).unwrap().cursor_position, None);

    h.clock.advance(time::Duration::seconds(5));
    h.engine.update_presence(h.doc, Some(CursorPosition::new(10.0, 20.0))).await;
    let stored = h.store.row(key).unwrap();
    assert_eq!(stored.cursor_position, Some(CursorPosition::new(10.0, 20.0)));
    assert_eq!(stored.last_seen, T0 + time::Duration::seconds(5));

    h.engine.join(h.doc).await;
    assert_eq!(h.store.row(key).unwrap().cursor_position, Some(CursorPosition::new(10.0, 20.0)));

    h.engine.update_presence(h.doc, None).await;
    assert_eq!(h.store.row(key).unwrap().cursor_position, None);
}

#[tokio::test]
async fn leave_deletes_own_record() {
    let h = harness();
    let other = Uuid::new_v4();
    h.engine.join(h.doc).await;
    seen_by(&h.store, h.doc, other, T0).await;

    assert!(h.engine.leave(h.doc).await);

    let rows = h.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, Some(other));
}

#[tokio::test]
async fn leave_failure_is_reported_once_without_retry() {
    let h = harness();
    h.engine.join(h.doc).await;
    h.store.fail_next(StoreOp::Delete);

    assert!(!h.engine.leave(h.doc).await);
    assert_eq!(h.store.calls().delete, 1);
    assert_eq!(h.notifier.errors(), vec!["Failed to leave collaboration".to_string()]);
}

// =============================================================================
// failures keep the engine usable
// =============================================================================

#[tokio::test]
async fn subscribe_failure_returns_to_unbound() {
    let h = harness();
    h.store.fail_next(StoreOp::Subscribe);

    assert_eq!(h.engine.subscribe(h.doc).await, PresencePhase::Unbound);
    assert_eq!(h.engine.document_id(), None);
    assert_eq!(h.notifier.errors(), vec!["Failed to connect to collaboration".to_string()]);

    assert_eq!(h.engine.subscribe(h.doc).await, PresencePhase::Active);
}

#[tokio::test]
async fn fetch_failure_keeps_previous_view_and_phase() {
    let h = harness();
    let other = Uuid::new_v4();
    seen_by(&h.store, h.doc, other, T0).await;
    h.engine.subscribe(h.doc).await;
    h.store.fail_next(StoreOp::Query);

    assert!(!h.engine.refresh(h.doc).await);
    assert!(h.engine.view().contains(other));
    assert_eq!(h.engine.phase(), PresencePhase::Active);
    assert_eq!(h.notifier.errors(), vec!["Failed to load collaborators".to_string()]);
}

#[tokio::test]
async fn refresh_for_another_document_is_ignored() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    let elsewhere = Uuid::new_v4();
    seen_by(&h.store, elsewhere, Uuid::new_v4(), T0).await;

    assert!(!h.engine.refresh(elsewhere).await);
    assert_eq!(h.engine.view().document_id, Some(h.doc));
}

// =============================================================================
// teardown
// =============================================================================

#[tokio::test]
async fn teardown_twice_cancels_once() {
    let h = harness();
    h.engine.subscribe(h.doc).await;

    h.engine.teardown().await;
    h.engine.teardown().await;

    assert_eq!(h.store.calls().unsubscribe, 1);
    assert_eq!(h.store.subscriber_count(), 0);
    assert_eq!(h.engine.phase(), PresencePhase::Unbound);
    assert!(h.engine.view().is_empty());
}

#[tokio::test]
async fn teardown_without_subscription_is_harmless() {
    let h = harness();
    h.engine.teardown().await;
    assert_eq!(h.store.calls().unsubscribe, 0);
}

#[tokio::test]
async fn torn_down_engine_ignores_later_changes() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    h.engine.teardown().await;
    let queries = h.store.calls().query;

    seen_by(&h.store, h.doc, Uuid::new_v4(), T0).await;
    tokio::task::yield_now().await;

    assert!(h.engine.view().is_empty());
    assert_eq!(h.store.calls().query, queries);
    assert!(!h.engine.refresh(h.doc).await);
}

#[tokio::test]
async fn resubscribe_tears_down_previous_feed() {
    let h = harness();
    let second = Uuid::new_v4();
    h.engine.subscribe(h.doc).await;

    assert_eq!(h.engine.subscribe(second).await, PresencePhase::Active);

    assert_eq!(h.store.calls().unsubscribe, 1);
    assert_eq!(h.store.subscriber_count(), 1);
    assert_eq!(h.engine.document_id(), Some(second));
    assert_eq!(h.engine.view().document_id, Some(second));
}

#[tokio::test(start_paused = true)]
async fn overlapping_subscribes_leave_one_feed() {
    let store = Arc::new(MemoryPresenceStore::new());
    let engine = slow_engine(&store);
    let doc = Uuid::new_v4();
    store.push_query_delay(Duration::from_millis(50));

    let (_, second) = tokio::join!(engine.subscribe(doc), engine.subscribe(doc));

    assert_eq!(second, PresencePhase::Active);
    assert_eq!(store.calls().subscribe, 2);
    assert_eq!(store.calls().unsubscribe, 1);
    assert_eq!(store.subscriber_count(), 1);

    engine.teardown().await;
    assert_eq!(store.subscriber_count(), 0);
    assert_eq!(store.calls().unsubscribe, 2);
}

#[tokio::test(start_paused = true)]
async fn teardown_abandons_subscribe_in_flight() {
    let store = Arc::new(MemoryPresenceStore::new());
    let engine = slow_engine(&store);
    let doc = Uuid::new_v4();

    let (phase, ()) = tokio::join!(engine.subscribe(doc), async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        engine.teardown().await;
    });

    assert_eq!(phase, PresencePhase::Unbound);
    assert_eq!(engine.phase(), PresencePhase::Unbound);
    assert_eq!(engine.document_id(), None);
    assert_eq!(store.subscriber_count(), 0);
    assert_eq!(store.calls().query, 0);
}

#[tokio::test]
async fn closed_feed_disconnects_and_notifies() {
    let h = harness();
    h.engine.subscribe(h.doc).await;

    h.store.close_feeds();
    settle_unsubscribes(&h.store, 1).await;

    assert_eq!(h.engine.phase(), PresencePhase::Disconnected);
    assert!(!h.engine.is_connected());
    assert_eq!(h.engine.document_id(), Some(h.doc));
    assert_eq!(h.notifier.errors(), vec!["Lost connection to collaboration".to_string()]);
    assert_eq!(h.store.calls().unsubscribe, 1);

    let other = Uuid::new_v4();
    seen_by(&h.store, h.doc, other, T0).await;
    tokio::task::yield_now().await;
    assert!(!h.engine.view().contains(other));

    assert_eq!(h.engine.subscribe(h.doc).await, PresencePhase::Active);
    assert!(h.engine.view().contains(other));
    assert!(
        h.notifier
            .notices()
            .iter()
            .any(|n| n.level == NoticeLevel::Info && n.message == "Reconnected to collaboration")
    );
    assert_eq!(h.store.subscriber_count(), 1);
}

#[tokio::test]
async fn dropping_engine_releases_subscription() {
    let h = harness();
    h.engine.subscribe(h.doc).await;
    let store = h.store.clone();
    drop(h);

    for _ in 0..10 {
        if store.calls().unsubscribe == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(store.calls().unsubscribe, 1);
    assert_eq!(store.subscriber_count(), 0);
}

// =============================================================================
// heartbeat
// =============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeat_refreshes_last_seen_until_teardown() {
    let h = harness();
    let key = PresenceKey { document_id: h.doc, user_id: h.me };
    h.engine.subscribe(h.doc).await;
    h.engine.join(h.doc).await;
    h.engine.spawn_heartbeat(h.doc, Duration::from_secs(30));

    h.clock.advance(time::Duration::seconds(31));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.store.row(key).unwrap().last_seen, T0 + time::Duration::seconds(31));

    h.engine.teardown().await;
    h.clock.advance(time::Duration::minutes(2));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.store.row(key).unwrap().last_seen, T0 + time::Duration::seconds(31));
}

#[tokio::test]
async fn collaborators_carry_stable_colors() {
    let h = harness();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    seen_by(&h.store, h.doc, a, T0).await;
    seen_by(&h.store, h.doc, b, T0).await;
    h.engine.subscribe(h.doc).await;

    let collaborators = h.engine.collaborators();
    assert_eq!(collaborators.len(), 2);
    assert!(collaborators[0].user_id < collaborators[1].user_id);
    for c in &collaborators {
        assert_eq!(c.color, collaborator_color(c.user_id));
    }
}
