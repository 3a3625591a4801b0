use crate::error::Result;
use crate::event::Event;
use crate::model::SessionKey;
use crate::session::SessionView;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub app_name: String,
    pub user_id: String,
    /// `None` generates a fresh v4 UUID.
    pub session_id: Option<String>,
    /// Initial state delta, scoped by `app:`/`user:`/plain-key prefix same
    /// as an event's `state_delta`.
    pub state: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct GetSessionConfig {
    pub num_recent_events: Option<usize>,
    pub after_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GetSessionRequest {
    pub key: SessionKey,
    pub config: GetSessionConfig,
}

#[derive(Debug, Clone)]
pub struct ListSessionsRequest {
    pub app_name: String,
    pub user_id: Option<String>,
}

/// Durable session-and-event store, generic over the storage engine that
/// implements [`crate::backend::Backend`]. All three backends in this
/// crate (in-memory, embedded, warehouse) share one implementation of
/// this trait: [`crate::store::SessionStore`].
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionView>;

    /// `Ok(None)` when no live session matches; never an error for a
    /// missing session.
    async fn get_session(&self, req: GetSessionRequest) -> Result<Option<SessionView>>;

    async fn list_sessions(&self, req: ListSessionsRequest) -> Result<Vec<SessionView>>;

    /// Idempotent: deleting an already-deleted or nonexistent session
    /// succeeds silently.
    async fn delete_session(&self, key: SessionKey) -> Result<()>;

    /// Append `event` under the OCC/retry protocol, mutating `session` in
    /// place on success (`last_update_time`, `events`, and `state` all
    /// advance to reflect the new event). Partial (streaming-fragment)
    /// events are accepted but never persisted and leave `session`
    /// untouched.
    async fn append_event(&self, session: &mut SessionView, event: Event) -> Result<Event>;

    /// Logically rewind to `target_event_id`: events after it are hidden
    /// from future reads and session-scope state is rebuilt from the
    /// surviving prefix, without deleting any event.
    async fn rewind_session(&self, key: SessionKey, target_event_id: &str) -> Result<SessionView>;

    /// Undo a rewind: every event becomes visible again and state is
    /// rebuilt from the full log.
    async fn clear_rewind(&self, key: SessionKey) -> Result<SessionView>;
}
