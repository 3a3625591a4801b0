//! Row-shaped types persisted by the `sessions` and `events` tables (and
//! their app/user state siblings). These are the wire format between
//! [`crate::backend::Backend`] adapters and [`crate::store::SessionStore`];
//! `Backend` implementations never leak their own SQL row types above this
//! module.

use chrono::{DateTime, Utc};

/// Natural key identifying one session: `(app_name, user_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into(), session_id: session_id.into() }
    }
}

/// One row of the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    /// Session-scope state only (no `app:`/`user:` keys), already JSON
    /// encoded, exactly as it's stored on disk.
    pub state_json: String,
    pub created_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub version: i64,
    pub is_deleted: bool,
    pub deleted_time: Option<DateTime<Utc>>,
    pub rewind_to_event_id: Option<String>,
    pub last_write_nonce: Option<String>,
}

/// One row of the `events` table.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub event_id: String,
    pub sequence_num: i64,
    pub event_timestamp: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub invocation_id: String,
    pub author: String,
    /// The full `Event`, JSON encoded, opaque to the store.
    pub event_data_json: String,
    /// The event's `state_delta`, JSON encoded (`None` when the event
    /// carried no state change at all, distinguish from an empty object).
    pub state_delta_json: Option<String>,
    pub has_state_delta: bool,
    pub is_after_rewind: bool,
}
