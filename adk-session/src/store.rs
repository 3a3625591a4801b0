//! The one [`crate::service::SessionService`] implementation shared by
//! every backend. `SessionStore<B>` owns all the engine-independent
//! protocol (OCC, retry, rewind, state projection) and delegates only the
//! storage primitives to `B: Backend`, so the protocol is written once
//! instead of duplicated per backend.

use crate::backend::{Backend, EventQuery};
use crate::error::{Result, SessionError};
use crate::event::Event;
use crate::model::{EventRow, SessionKey, SessionRow};
use crate::service::{
    CreateSessionRequest, GetSessionRequest, ListSessionsRequest, SessionService,
};
use crate::session::SessionView;
use crate::state::{apply_delta, merge_states, split_delta};
use adk_core::event::KEY_PREFIX_TEMP;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Width of the per-version sequence window: `sequence_num = version *
/// SEQUENCE_BASE + offset`. Large enough that no single append round trip
/// plausibly produces 1000 events sharing a version; left fixed rather
/// than made configurable.
const SEQUENCE_BASE: i64 = 1000;

const MAX_RETRIES: usize = 3;
const RETRY_DELAYS_MS: [u64; MAX_RETRIES] = [100, 200, 300];

pub struct SessionStore<B: Backend> {
    backend: B,
}

impl<B: Backend> SessionStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn build_view(&self, row: &SessionRow, events: Vec<Event>) -> Result<SessionView> {
        let key = SessionKey::new(&row.app_name, &row.user_id, &row.session_id);
        let session_state = self.backend.decode_state(
            &format!("session {}/{}/{}", row.app_name, row.user_id, row.session_id),
            &row.state_json,
        )?;
        let app_state = self.backend.select_app_state(&row.app_name).await?;
        let user_state = self.backend.select_user_state(&row.app_name, &row.user_id).await?;
        let state = merge_states(&app_state, &user_state, &session_state);

        Ok(SessionView {
            key,
            state,
            events,
            last_update_time: row.update_time,
            version: row.version,
            rewind_to_event_id: row.rewind_to_event_id.clone(),
        })
    }

    /// A single append attempt: read-modify-write with the OCC witness
    /// re-read. Returns `Err(SessionError::Stale { .. } | VersionConflict {
    /// .. })` on a detected race so the caller can retry. The third element
    /// of the success tuple is whether `event`'s id was newly inserted into
    /// the event log, false when it was already present (an idempotent
    /// retry of an earlier successful append).
    async fn try_append(&self, key: &SessionKey, snapshot_last_update_time: chrono::DateTime<Utc>, event: &Event) -> Result<(SessionRow, i64, bool)> {
        let row = self.backend.select_session(key).await?.ok_or(SessionError::NotFound)?;
        if row.is_deleted {
            return Err(SessionError::NotFound);
        }
        if row.update_time > snapshot_last_update_time {
            return Err(SessionError::Stale { stored: row.update_time, snapshot: snapshot_last_update_time });
        }

        let current_session_state = self
            .backend
            .decode_state(&format!("session {}/{}/{}", key.app_name, key.user_id, key.session_id), &row.state_json)?;
        let (app_delta, user_delta, session_delta) = split_delta(&event.actions.state_delta);
        let next_session_state = apply_delta(&current_session_state, &session_delta);
        let next_state_json =
            serde_json::to_string(&next_session_state).map_err(|e| SessionError::BackendIO(e.to_string()))?;

        let now = Utc::now();
        let nonce = Uuid::new_v4().to_string();
        let expected_version_after = row.version + 1;

        self.backend
            .update_session_conditional(key, row.version, &next_state_json, now, &nonce)
            .await?;

        if !self.backend.verify_write(key, expected_version_after, &nonce).await? {
            return Err(SessionError::VersionConflict { expected: expected_version_after });
        }

        let sequence_base = expected_version_after * SEQUENCE_BASE;
        let offset = self
            .backend
            .count_events_in_sequence_window(key, sequence_base, sequence_base + SEQUENCE_BASE)
            .await?;
        let sequence_num = sequence_base + offset;

        let has_state_delta = !event.actions.state_delta.is_empty();
        let state_delta_json = if has_state_delta {
            Some(
                serde_json::to_string(&event.actions.state_delta)
                    .map_err(|e| SessionError::BackendIO(e.to_string()))?,
            )
        } else {
            None
        };
        let event_data_json =
            serde_json::to_string(event).map_err(|e| SessionError::BackendIO(e.to_string()))?;

        let event_row = EventRow {
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            session_id: key.session_id.clone(),
            event_id: event.id.clone(),
            sequence_num,
            event_timestamp: event.timestamp,
            created_time: now,
            invocation_id: event.invocation_id.clone(),
            author: event.author.clone(),
            event_data_json,
            state_delta_json,
            has_state_delta,
            is_after_rewind: false,
        };
        let inserted = self.backend.merge_event(&event_row).await?;

        if !app_delta.is_empty() {
            self.backend.upsert_app_state(&key.app_name, &app_delta).await?;
        }
        if !user_delta.is_empty() {
            self.backend.upsert_user_state(&key.app_name, &key.user_id, &user_delta).await?;
        }

        let mut updated_row = row;
        updated_row.version = expected_version_after;
        updated_row.update_time = now;
        updated_row.state_json = next_state_json;
        updated_row.last_write_nonce = Some(nonce);
        Ok((updated_row, sequence_num, inserted))
    }
}

#[async_trait]
impl<B: Backend> SessionService for SessionStore<B> {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionView> {
        self.backend.ensure_tables().await?;

        let session_id = req.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = SessionKey::new(req.app_name.clone(), req.user_id.clone(), session_id);

        if let Some(existing) = self.backend.select_session(&key).await? {
            if !existing.is_deleted {
                return Err(SessionError::AlreadyExists);
            }
        }

        let (app_delta, user_delta, session_state) = split_delta(&req.state);
        if !app_delta.is_empty() {
            self.backend.upsert_app_state(&key.app_name, &app_delta).await?;
        }
        if !user_delta.is_empty() {
            self.backend.upsert_user_state(&key.app_name, &key.user_id, &user_delta).await?;
        }

        let now = Utc::now();
        let row = SessionRow {
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            session_id: key.session_id.clone(),
            state_json: serde_json::to_string(&session_state)
                .map_err(|e| SessionError::BackendIO(e.to_string()))?,
            created_time: now,
            update_time: now,
            version: 1,
            is_deleted: false,
            deleted_time: None,
            rewind_to_event_id: None,
            last_write_nonce: None,
        };
        self.backend.insert_session(&row).await?;

        tracing::info!(
            app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id,
            "created session"
        );
        self.build_view(&row, Vec::new()).await
    }

    async fn get_session(&self, req: GetSessionRequest) -> Result<Option<SessionView>> {
        self.backend.ensure_tables().await?;

        let Some(row) = self.backend.select_session(&req.key).await? else {
            return Ok(None);
        };
        if row.is_deleted {
            return Ok(None);
        }

        let query = EventQuery {
            num_recent_events: req.config.num_recent_events,
            after_timestamp: req.config.after_timestamp,
            include_after_rewind: false,
        };
        let event_rows = self.backend.select_events(&req.key, &query).await?;
        let events = decode_events(&event_rows);

        Ok(Some(self.build_view(&row, events).await?))
    }

    async fn list_sessions(&self, req: ListSessionsRequest) -> Result<Vec<SessionView>> {
        self.backend.ensure_tables().await?;

        let rows = self.backend.select_sessions(&req.app_name, req.user_id.as_deref()).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in &rows {
            views.push(self.build_view(row, Vec::new()).await?);
        }
        Ok(views)
    }

    async fn delete_session(&self, key: SessionKey) -> Result<()> {
        self.backend.ensure_tables().await?;
        self.backend.soft_delete_session(&key, Utc::now()).await?;
        tracing::info!(app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id, "deleted session");
        Ok(())
    }

    async fn append_event(&self, session: &mut SessionView, mut event: Event) -> Result<Event> {
        self.backend.ensure_tables().await?;

        if event.is_partial() {
            return Ok(event);
        }
        event.actions.state_delta.retain(|k, _| !k.starts_with(KEY_PREFIX_TEMP));

        // Baseline for the staleness gate. Distinct from
        // `session.last_update_time`, which the caller owns: a genuine
        // `Stale` means the caller's copy predates the stored row and is
        // surfaced as-is (fixing it is the caller's job). A
        // `VersionConflict`, in contrast, means this writer's own read was
        // not stale when it was taken, it simply lost a race during the
        // write, so the baseline is advanced to the update_time observed
        // at conflict time before retrying; otherwise the next attempt's
        // fresh read would immediately look stale against the untouched
        // baseline and a retry that should succeed at a later version
        // never would.
        let mut baseline = session.last_update_time;

        let mut last_err = SessionError::NotFound;
        for attempt in 0..MAX_RETRIES {
            match self.try_append(&session.key, baseline, &event).await {
                Ok((row, _sequence_num, inserted)) => {
                    if inserted {
                        session.state = apply_delta(&session.state, &event.actions.state_delta);
                        session.last_update_time = row.update_time;
                        session.version = row.version;
                        session.events.push(event.clone());
                    } else {
                        tracing::info!(
                            event_id = %event.id,
                            "append_event retried with an event_id already in the log, skipping duplicate insert"
                        );
                    }
                    return Ok(event);
                }
                Err(SessionError::VersionConflict { expected }) => {
                    let err = SessionError::VersionConflict { expected };
                    tracing::warn!(
                        attempt, event_id = %event.id, error = %err,
                        "version conflict appending event, retrying"
                    );
                    if let Some(row) = self.backend.select_session(&session.key).await? {
                        baseline = row.update_time;
                    }
                    last_err = err;
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAYS_MS[attempt])).await;
                    }
                }
                Err(err @ SessionError::Stale { .. }) => {
                    tracing::warn!(
                        attempt, event_id = %event.id, error = %err,
                        "stale snapshot appending event, retrying"
                    );
                    last_err = err;
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAYS_MS[attempt])).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn rewind_session(&self, key: SessionKey, target_event_id: &str) -> Result<SessionView> {
        self.backend.ensure_tables().await?;

        let target_seq = self
            .backend
            .event_sequence_num(&key, target_event_id)
            .await?
            .ok_or(SessionError::NotFound)?;

        self.backend.update_events_flag(&key, Some(target_seq), true).await?;

        let all_events = self
            .backend
            .select_events(
                &key,
                &EventQuery { num_recent_events: None, after_timestamp: None, include_after_rewind: true },
            )
            .await?;
        let new_session_state = crate::replay::rebuild(&all_events, Some(target_seq));
        let new_state_json =
            serde_json::to_string(&new_session_state).map_err(|e| SessionError::BackendIO(e.to_string()))?;

        let now = Utc::now();
        self.backend.set_rewind_pointer(&key, &new_state_json, now, Some(target_event_id)).await?;

        tracing::info!(app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id, target_event_id, "rewound session");

        let row = self.backend.select_session(&key).await?.ok_or(SessionError::NotFound)?;
        let visible_events = self
            .backend
            .select_events(
                &key,
                &EventQuery { num_recent_events: None, after_timestamp: None, include_after_rewind: false },
            )
            .await?;
        self.build_view(&row, decode_events(&visible_events)).await
    }

    async fn clear_rewind(&self, key: SessionKey) -> Result<SessionView> {
        self.backend.ensure_tables().await?;

        self.backend.update_events_flag(&key, None, false).await?;

        let all_events = self
            .backend
            .select_events(
                &key,
                &EventQuery { num_recent_events: None, after_timestamp: None, include_after_rewind: true },
            )
            .await?;
        let new_session_state = crate::replay::rebuild(&all_events, None);
        let new_state_json =
            serde_json::to_string(&new_session_state).map_err(|e| SessionError::BackendIO(e.to_string()))?;

        let now = Utc::now();
        self.backend.set_rewind_pointer(&key, &new_state_json, now, None).await?;

        tracing::info!(app_name = %key.app_name, user_id = %key.user_id, session_id = %key.session_id, "cleared rewind");

        let row = self.backend.select_session(&key).await?.ok_or(SessionError::NotFound)?;
        self.build_view(&row, decode_events(&all_events)).await
    }
}

fn decode_events(rows: &[EventRow]) -> Vec<Event> {
    rows.iter()
        .filter_map(|row| match serde_json::from_str::<Event>(&row.event_data_json) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(event_id = %row.event_id, error = %err, "skipping unreadable event payload");
                None
            }
        })
        .collect()
}
