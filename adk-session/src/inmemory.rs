//! In-process backend for local development and unit tests. Implements the
//! same [`crate::backend::Backend`] contract the embedded and warehouse
//! backends do, so it exercises the identical OCC/rewind protocol in
//! [`crate::store::SessionStore`] instead of overwriting state wholesale.

use crate::backend::{apply_event_query, Backend, EventQuery};
use crate::error::{Result, SessionError};
use crate::model::{EventRow, SessionKey, SessionRow};
use crate::state::apply_delta;
use crate::store::SessionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

type RowKey = (String, String, String);

#[derive(Default)]
struct Tables {
    sessions: HashMap<RowKey, SessionRow>,
    events: HashMap<RowKey, Vec<EventRow>>,
    app_states: HashMap<String, HashMap<String, Value>>,
    user_states: HashMap<(String, String), HashMap<String, Value>>,
}

fn key_tuple(key: &SessionKey) -> RowKey {
    (key.app_name.clone(), key.user_id.clone(), key.session_id.clone())
}

fn row_key(row: &EventRow) -> RowKey {
    (row.app_name.clone(), row.user_id.clone(), row.session_id.clone())
}

pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self { tables: RwLock::new(Tables::default()) }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience alias for a session service backed purely by process
/// memory.
pub type InMemorySessionService = SessionStore<InMemoryBackend>;

impl InMemorySessionService {
    pub fn new() -> Self {
        SessionStore::new(InMemoryBackend::new())
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn ensure_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn select_session(&self, key: &SessionKey) -> Result<Option<SessionRow>> {
        Ok(self.tables.read().unwrap().sessions.get(&key_tuple(key)).cloned())
    }

    async fn select_events(&self, key: &SessionKey, query: &EventQuery) -> Result<Vec<EventRow>> {
        let rows: Vec<EventRow> =
            self.tables.read().unwrap().events.get(&key_tuple(key)).cloned().unwrap_or_default();
        Ok(apply_event_query(rows, query))
    }

    async fn select_sessions(
        &self,
        app_name: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<SessionRow>> {
        let mut rows: Vec<SessionRow> = self
            .tables
            .read()
            .unwrap()
            .sessions
            .values()
            .filter(|r| {
                r.app_name == app_name && !r.is_deleted && user_id.is_none_or(|u| r.user_id == u)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.update_time.cmp(&a.update_time));
        Ok(rows)
    }

    async fn select_app_state(&self, app_name: &str) -> Result<HashMap<String, Value>> {
        Ok(self.tables.read().unwrap().app_states.get(app_name).cloned().unwrap_or_default())
    }

    async fn select_user_state(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<HashMap<String, Value>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .user_states
            .get(&(app_name.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn decode_state(&self, context: &str, json: &str) -> Result<HashMap<String, Value>> {
        match serde_json::from_str(json) {
            Ok(state) => Ok(state),
            Err(err) => {
                tracing::warn!(context, error = %err, "state JSON unreadable, substituting empty state");
                Ok(HashMap::new())
            }
        }
    }

    async fn insert_session(&self, row: &SessionRow) -> Result<()> {
        self.tables.write().unwrap().sessions.insert(
            (row.app_name.clone(), row.user_id.clone(), row.session_id.clone()),
            row.clone(),
        );
        Ok(())
    }

    async fn update_session_conditional(
        &self,
        key: &SessionKey,
        expected_version: i64,
        new_state_json: &str,
        now: DateTime<Utc>,
        nonce: &str,
    ) -> Result<()> {
        if let Some(row) = self.tables.write().unwrap().sessions.get_mut(&key_tuple(key)) {
            if row.version == expected_version {
                row.state_json = new_state_json.to_string();
                row.update_time = now;
                row.version += 1;
                row.last_write_nonce = Some(nonce.to_string());
            }
        }
        Ok(())
    }

    async fn verify_write(
        &self,
        key: &SessionKey,
        expected_version_after_write: i64,
        nonce: &str,
    ) -> Result<bool> {
        Ok(self.tables.read().unwrap().sessions.get(&key_tuple(key)).is_some_and(|row| {
            row.version == expected_version_after_write
                && row.last_write_nonce.as_deref() == Some(nonce)
        }))
    }

    async fn soft_delete_session(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.tables.write().unwrap().sessions.get_mut(&key_tuple(key)) {
            row.is_deleted = true;
            row.deleted_time = Some(now);
        }
        Ok(())
    }

    async fn merge_event(&self, row: &EventRow) -> Result<bool> {
        let mut tables = self.tables.write().unwrap();
        let list = tables.events.entry(row_key(row)).or_default();
        if list.iter().any(|existing| existing.event_id == row.event_id) {
            return Ok(false);
        }
        list.push(row.clone());
        Ok(true)
    }

    async fn count_events_in_sequence_window(
        &self,
        key: &SessionKey,
        lo: i64,
        hi: i64,
    ) -> Result<i64> {
        let count = self.tables.read().unwrap().events.get(&key_tuple(key)).map_or(0, |rows| {
            rows.iter().filter(|r| r.sequence_num >= lo && r.sequence_num < hi).count()
        });
        Ok(count as i64)
    }

    async fn upsert_app_state(&self, app_name: &str, delta: &HashMap<String, Value>) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables.app_states.entry(app_name.to_string()).or_default();
        *entry = apply_delta(entry, delta);
        Ok(())
    }

    async fn upsert_user_state(
        &self,
        app_name: &str,
        user_id: &str,
        delta: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry =
            tables.user_states.entry((app_name.to_string(), user_id.to_string())).or_default();
        *entry = apply_delta(entry, delta);
        Ok(())
    }

    async fn update_events_flag(
        &self,
        key: &SessionKey,
        min_sequence_exclusive: Option<i64>,
        value: bool,
    ) -> Result<()> {
        if let Some(rows) = self.tables.write().unwrap().events.get_mut(&key_tuple(key)) {
            for row in rows.iter_mut() {
                match min_sequence_exclusive {
                    Some(min) => {
                        if row.sequence_num > min {
                            row.is_after_rewind = value;
                        }
                    }
                    None => row.is_after_rewind = value,
                }
            }
        }
        Ok(())
    }

    async fn set_rewind_pointer(
        &self,
        key: &SessionKey,
        state_json: &str,
        now: DateTime<Utc>,
        rewind_to_event_id: Option<&str>,
    ) -> Result<()> {
        if let Some(row) = self.tables.write().unwrap().sessions.get_mut(&key_tuple(key)) {
            row.state_json = state_json.to_string();
            row.update_time = now;
            row.version += 1;
            row.rewind_to_event_id = rewind_to_event_id.map(|s| s.to_string());
        } else {
            return Err(SessionError::NotFound);
        }
        Ok(())
    }

    async fn event_sequence_num(&self, key: &SessionKey, event_id: &str) -> Result<Option<i64>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .events
            .get(&key_tuple(key))
            .and_then(|rows| rows.iter().find(|r| r.event_id == event_id).map(|r| r.sequence_num)))
    }
}
