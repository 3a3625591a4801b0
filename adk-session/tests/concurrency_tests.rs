//! Concurrent writers targeting the same session. At most one writer's
//! conditional update wins the race for a given target version; the
//! loser's OCC nonce fails re-verification (`VersionConflict`), and the
//! store's own retry loop carries it forward to the next version rather
//! than losing the event. A barrier forces the precise interleaving
//! ("two writers read the same version=5") deterministically, since real
//! OS-thread scheduling gives no such guarantee.

use adk_session::{
    Backend, CreateSessionRequest, Event, EventQuery, EventRow, GetSessionConfig,
    GetSessionRequest, InMemoryBackend, SessionKey, SessionRow, SessionService, SessionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates every [`Backend`] call to an inner [`InMemoryBackend`], except
/// `update_session_conditional`, which first waits at a two-party barrier,
/// but only for the first two calls made through it. This forces the two
/// racing writers' first attempts to have both completed their "read
/// current row" step before either is allowed to write, an interleaving
/// real scheduling cannot guarantee deterministically in a test. Any
/// subsequent retry attempt is the lone survivor of that race and must not
/// wait on a second party that will never arrive.
struct RaceBackend {
    inner: InMemoryBackend,
    barrier: Arc<tokio::sync::Barrier>,
    barrier_uses_left: AtomicUsize,
}

#[async_trait]
impl Backend for RaceBackend {
    async fn ensure_tables(&self) -> adk_session::Result<()> {
        self.inner.ensure_tables().await
    }
    async fn select_session(&self, key: &SessionKey) -> adk_session::Result<Option<SessionRow>> {
        self.inner.select_session(key).await
    }
    async fn select_events(
        &self,
        key: &SessionKey,
        query: &EventQuery,
    ) -> adk_session::Result<Vec<EventRow>> {
        self.inner.select_events(key, query).await
    }
    async fn select_sessions(
        &self,
        app_name: &str,
        user_id: Option<&str>,
    ) -> adk_session::Result<Vec<SessionRow>> {
        self.inner.select_sessions(app_name, user_id).await
    }
    async fn select_app_state(&self, app_name: &str) -> adk_session::Result<HashMap<String, Value>> {
        self.inner.select_app_state(app_name).await
    }
    async fn select_user_state(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> adk_session::Result<HashMap<String, Value>> {
        self.inner.select_user_state(app_name, user_id).await
    }
    fn decode_state(&self, context: &str, json: &str) -> adk_session::Result<HashMap<String, Value>> {
        self.inner.decode_state(context, json)
    }
    async fn insert_session(&self, row: &SessionRow) -> adk_session::Result<()> {
        self.inner.insert_session(row).await
    }
    async fn update_session_conditional(
        &self,
        key: &SessionKey,
        expected_version: i64,
        new_state_json: &str,
        now: DateTime<Utc>,
        nonce: &str,
    ) -> adk_session::Result<()> {
        // Both racing writers have already read the row (step 3 happens
        // before this call in `try_append`); wait here so neither proceeds
        // to write until both have arrived, guaranteeing the TOCTOU race.
        // Only the two first-attempt calls consume the barrier; a retry
        // has no second party left to wait for.
        let consume = self
            .barrier_uses_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consume {
            self.barrier.wait().await;
        }
        self.inner.update_session_conditional(key, expected_version, new_state_json, now, nonce).await
    }
    async fn verify_write(
        &self,
        key: &SessionKey,
        expected_version_after_write: i64,
        nonce: &str,
    ) -> adk_session::Result<bool> {
        self.inner.verify_write(key, expected_version_after_write, nonce).await
    }
    async fn soft_delete_session(&self, key: &SessionKey, now: DateTime<Utc>) -> adk_session::Result<()> {
        self.inner.soft_delete_session(key, now).await
    }
    async fn merge_event(&self, row: &EventRow) -> adk_session::Result<bool> {
        self.inner.merge_event(row).await
    }
    async fn count_events_in_sequence_window(
        &self,
        key: &SessionKey,
        lo: i64,
        hi: i64,
    ) -> adk_session::Result<i64> {
        self.inner.count_events_in_sequence_window(key, lo, hi).await
    }
    async fn upsert_app_state(
        &self,
        app_name: &str,
        delta: &HashMap<String, Value>,
    ) -> adk_session::Result<()> {
        self.inner.upsert_app_state(app_name, delta).await
    }
    async fn upsert_user_state(
        &self,
        app_name: &str,
        user_id: &str,
        delta: &HashMap<String, Value>,
    ) -> adk_session::Result<()> {
        self.inner.upsert_user_state(app_name, user_id, delta).await
    }
    async fn update_events_flag(
        &self,
        key: &SessionKey,
        min_sequence_exclusive: Option<i64>,
        value: bool,
    ) -> adk_session::Result<()> {
        self.inner.update_events_flag(key, min_sequence_exclusive, value).await
    }
    async fn set_rewind_pointer(
        &self,
        key: &SessionKey,
        state_json: &str,
        now: DateTime<Utc>,
        rewind_to_event_id: Option<&str>,
    ) -> adk_session::Result<()> {
        self.inner.set_rewind_pointer(key, state_json, now, rewind_to_event_id).await
    }
    async fn event_sequence_num(
        &self,
        key: &SessionKey,
        event_id: &str,
    ) -> adk_session::Result<Option<i64>> {
        self.inner.event_sequence_num(key, event_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_appends_both_eventually_commit() {
    let backend = InMemoryBackend::new();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let store = Arc::new(SessionStore::new(RaceBackend {
        inner: backend,
        barrier,
        barrier_uses_left: AtomicUsize::new(2),
    }));

    let created = store
        .create_session(CreateSessionRequest {
            app_name: "app".to_string(),
            user_id: "u1".to_string(),
            session_id: Some("s1".to_string()),
            state: HashMap::new(),
        })
        .await
        .unwrap();

    let store_a = store.clone();
    let store_b = store.clone();
    let mut snapshot_a = created.clone();
    let mut snapshot_b = created.clone();

    let handle_a = tokio::spawn(async move {
        let mut event = Event::new("writer-a");
        event.actions.state_delta.insert("writer".to_string(), json!("a"));
        store_a.append_event(&mut snapshot_a, event).await
    });
    let handle_b = tokio::spawn(async move {
        let mut event = Event::new("writer-b");
        event.actions.state_delta.insert("writer".to_string(), json!("b"));
        store_b.append_event(&mut snapshot_b, event).await
    });

    let (result_a, result_b) = tokio::join!(handle_a, handle_b);
    result_a.unwrap().unwrap();
    result_b.unwrap().unwrap();

    let fetched = store
        .get_session(GetSessionRequest {
            key: SessionKey::new("app", "u1", "s1"),
            config: GetSessionConfig::default(),
        })
        .await
        .unwrap()
        .unwrap();

    // Both appends landed; the loser's VersionConflict was absorbed by the
    // store's own retry, not surfaced to the caller or dropped silently.
    assert_eq!(fetched.events.len(), 2);
    assert_eq!(fetched.version, 3);
}

#[tokio::test]
async fn duplicate_event_id_is_idempotent_on_retry() {
    let store = SessionStore::new(InMemoryBackend::new());
    let created = store
        .create_session(CreateSessionRequest {
            app_name: "app".to_string(),
            user_id: "u1".to_string(),
            session_id: Some("s1".to_string()),
            state: HashMap::new(),
        })
        .await
        .unwrap();

    let event = Event::with_id("fixed-id", "inv-1");

    let mut first = created.clone();
    store.append_event(&mut first, event.clone()).await.unwrap();

    // A client retry carrying the identical event_id, issued from a
    // snapshot that has already observed the first append.
    let mut second = first.clone();
    store.append_event(&mut second, event).await.unwrap();

    let fetched = store
        .get_session(GetSessionRequest { key: created.key, config: GetSessionConfig::default() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.events.iter().filter(|e| e.id == "fixed-id").count(), 1);
}
