//! The adapter seam between [`crate::store::SessionStore`] and a concrete
//! storage engine. `SessionStore<B>` implements all OCC, retry, and rewind
//! logic once against this trait; `Backend` implementors only need to get
//! these primitives right for their engine.

use crate::error::Result;
use crate::model::{EventRow, SessionKey, SessionRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Filters applied when reading back a session's event log.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Keep only the N most-recent events (canonical order preserved in the
    /// result). `None` returns the whole log.
    pub num_recent_events: Option<usize>,
    /// Keep only events at or after this timestamp.
    pub after_timestamp: Option<DateTime<Utc>>,
    /// When `false` (the default, used by `get_session`), events with
    /// `is_after_rewind = true` are excluded. `rewind_session` and
    /// `clear_rewind` need the full log including rewound events, so they
    /// set this to `true`.
    pub include_after_rewind: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Create the four tables if they don't exist yet. Must be safe to call
    /// repeatedly and concurrently; implementations guard this with an
    /// internal single-flight latch rather than relying on the caller to
    /// call it once.
    async fn ensure_tables(&self) -> Result<()>;

    /// Fetch one session row regardless of `is_deleted`; the caller decides
    /// how to treat a soft-deleted row.
    async fn select_session(&self, key: &SessionKey) -> Result<Option<SessionRow>>;

    /// Fetch events for one session in canonical order
    /// `(sequence_num, created_time, event_id)`, ascending.
    async fn select_events(&self, key: &SessionKey, query: &EventQuery) -> Result<Vec<EventRow>>;

    /// List non-deleted sessions for an app, optionally narrowed to one
    /// user, most-recently-updated first.
    async fn select_sessions(
        &self,
        app_name: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<SessionRow>>;

    /// Decoded app-scope state for one app. Empty map if none recorded yet.
    async fn select_app_state(&self, app_name: &str) -> Result<HashMap<String, Value>>;

    /// Decoded user-scope state for one (app, user) pair.
    async fn select_user_state(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<HashMap<String, Value>>;

    /// Decode a stored state JSON blob, applying this adapter's own
    /// corruption recovery policy: the embedded backend logs and
    /// substitutes an empty map, the warehouse backend fails loudly.
    fn decode_state(&self, context: &str, json: &str) -> Result<HashMap<String, Value>>;

    /// Write a session row keyed on its natural key, upserting: overwrite
    /// any row already there (including a soft-deleted one, reviving it)
    /// rather than erroring on conflict. The caller has already checked
    /// there's no *live* row at this key; this only needs to handle the
    /// soft-deleted-row-at-the-same-key case.
    async fn insert_session(&self, row: &SessionRow) -> Result<()>;

    /// `UPDATE sessions SET state_json = ?, update_time = ?, version = version + 1,
    /// last_write_nonce = ? WHERE key = ? AND version = expected_version`.
    /// Does not itself report whether the row count is trustworthy; the
    /// caller always re-verifies via [`Backend::verify_write`].
    async fn update_session_conditional(
        &self,
        key: &SessionKey,
        expected_version: i64,
        new_state_json: &str,
        now: DateTime<Utc>,
        nonce: &str,
    ) -> Result<()>;

    /// Re-read the row and confirm `version == expected_version_after_write`
    /// and `last_write_nonce == nonce`; this, not the conditional update's
    /// reported row count, is the OCC witness.
    async fn verify_write(
        &self,
        key: &SessionKey,
        expected_version_after_write: i64,
        nonce: &str,
    ) -> Result<bool>;

    /// Mark a session `is_deleted = TRUE`. A no-op, not an error, if the
    /// session doesn't exist or is already deleted.
    async fn soft_delete_session(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<()>;

    /// Idempotent append: a no-op if `event_id` already exists for this
    /// session. Returns `true` if a new row was inserted, `false` if the
    /// `event_id` already existed, so callers can tell a fresh append from
    /// a duplicate retry.
    async fn merge_event(&self, row: &EventRow) -> Result<bool>;

    /// Count events with `sequence_num` in `[lo, hi)` for this session,
    /// used to derive the next offset within a version's sequence window.
    async fn count_events_in_sequence_window(
        &self,
        key: &SessionKey,
        lo: i64,
        hi: i64,
    ) -> Result<i64>;

    /// Merge an app-scope delta into the app_states table (insert-or-update,
    /// deleting keys set to `null`).
    async fn upsert_app_state(&self, app_name: &str, delta: &HashMap<String, Value>) -> Result<()>;

    /// Merge a user-scope delta into the user_states table.
    async fn upsert_user_state(
        &self,
        app_name: &str,
        user_id: &str,
        delta: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Set `is_after_rewind = value` for events with `sequence_num >
    /// min_sequence_exclusive` (or for all events, when `None`).
    async fn update_events_flag(
        &self,
        key: &SessionKey,
        min_sequence_exclusive: Option<i64>,
        value: bool,
    ) -> Result<()>;

    /// Unconditionally overwrite the session's state, bump `update_time`,
    /// increment `version`, and set (or clear) `rewind_to_event_id`. Used
    /// only by `rewind_session`/`clear_rewind`, which own the whole session
    /// at that point and don't need OCC.
    async fn set_rewind_pointer(
        &self,
        key: &SessionKey,
        state_json: &str,
        now: DateTime<Utc>,
        rewind_to_event_id: Option<&str>,
    ) -> Result<()>;

    /// Look up the `sequence_num` of one event, to resolve a rewind target.
    async fn event_sequence_num(&self, key: &SessionKey, event_id: &str) -> Result<Option<i64>>;
}

/// Sort into canonical order and apply an [`EventQuery`]'s filters. Shared
/// by every `Backend` so "recent N, in canonical order" means the same
/// thing regardless of which adapter fetched the rows.
pub fn apply_event_query(mut rows: Vec<EventRow>, query: &EventQuery) -> Vec<EventRow> {
    rows.sort_by(|a, b| {
        (a.sequence_num, a.created_time, &a.event_id).cmp(&(b.sequence_num, b.created_time, &b.event_id))
    });
    if !query.include_after_rewind {
        rows.retain(|r| !r.is_after_rewind);
    }
    if let Some(after) = query.after_timestamp {
        rows.retain(|r| r.event_timestamp >= after);
    }
    if let Some(n) = query.num_recent_events {
        if rows.len() > n {
            let start = rows.len() - n;
            rows = rows[start..].to_vec();
        }
    }
    rows
}
