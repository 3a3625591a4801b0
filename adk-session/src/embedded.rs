//! Embedded backend: a local SQLite database via `sqlx`. Meant for local
//! development, single-process deployments, and tests, not multi-writer
//! production traffic, which is the warehouse backend's job.

use crate::backend::{apply_event_query, Backend, EventQuery};
use crate::error::{Result, SessionError};
use crate::model::{EventRow, SessionKey, SessionRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::OnceCell;

#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    /// An `sqlx` SQLite connection string, e.g. `sqlite::memory:` or
    /// `sqlite://./sessions.db`.
    pub database_url: String,
    pub max_connections: u32,
}

impl EmbeddedConfig {
    pub fn memory() -> Self {
        Self { database_url: "sqlite::memory:".to_string(), max_connections: 1 }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self { database_url: format!("sqlite://{}", path.into()), max_connections: 5 }
    }
}

pub struct EmbeddedBackend {
    pool: SqlitePool,
    tables_ready: OnceCell<()>,
}

impl EmbeddedBackend {
    pub async fn new(config: EmbeddedConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| SessionError::BackendIO(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| SessionError::BackendIO(e.to_string()))?;
        Ok(Self { pool, tables_ready: OnceCell::new() })
    }

    fn session_from_row(row: SqliteRow) -> Result<SessionRow> {
        Ok(SessionRow {
            app_name: row.try_get("app_name").map_err(sqlx_err)?,
            user_id: row.try_get("user_id").map_err(sqlx_err)?,
            session_id: row.try_get("session_id").map_err(sqlx_err)?,
            state_json: row.try_get("state_json").map_err(sqlx_err)?,
            created_time: row.try_get("created_time").map_err(sqlx_err)?,
            update_time: row.try_get("update_time").map_err(sqlx_err)?,
            version: row.try_get("version").map_err(sqlx_err)?,
            is_deleted: row.try_get("is_deleted").map_err(sqlx_err)?,
            deleted_time: row.try_get("deleted_time").map_err(sqlx_err)?,
            rewind_to_event_id: row.try_get("rewind_to_event_id").map_err(sqlx_err)?,
            last_write_nonce: row.try_get("last_write_nonce").map_err(sqlx_err)?,
        })
    }

    fn event_from_row(row: SqliteRow) -> Result<EventRow> {
        Ok(EventRow {
            app_name: row.try_get("app_name").map_err(sqlx_err)?,
            user_id: row.try_get("user_id").map_err(sqlx_err)?,
            session_id: row.try_get("session_id").map_err(sqlx_err)?,
            event_id: row.try_get("event_id").map_err(sqlx_err)?,
            sequence_num: row.try_get("sequence_num").map_err(sqlx_err)?,
            event_timestamp: row.try_get("event_timestamp").map_err(sqlx_err)?,
            created_time: row.try_get("created_time").map_err(sqlx_err)?,
            invocation_id: row.try_get("invocation_id").map_err(sqlx_err)?,
            author: row.try_get("author").map_err(sqlx_err)?,
            event_data_json: row.try_get("event_data_json").map_err(sqlx_err)?,
            state_delta_json: row.try_get("state_delta_json").map_err(sqlx_err)?,
            has_state_delta: row.try_get("has_state_delta").map_err(sqlx_err)?,
            is_after_rewind: row.try_get("is_after_rewind").map_err(sqlx_err)?,
        })
    }
}

fn sqlx_err(err: sqlx::Error) -> SessionError {
    SessionError::BackendIO(err.to_string())
}

#[async_trait]
impl Backend for EmbeddedBackend {
    async fn ensure_tables(&self) -> Result<()> {
        self.tables_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sessions (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        state_json TEXT NOT NULL,
                        created_time TEXT NOT NULL,
                        update_time TEXT NOT NULL,
                        version INTEGER NOT NULL,
                        is_deleted BOOLEAN NOT NULL DEFAULT 0,
                        deleted_time TEXT,
                        rewind_to_event_id TEXT,
                        last_write_nonce TEXT,
                        PRIMARY KEY (app_name, user_id, session_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS events (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        event_id TEXT NOT NULL,
                        sequence_num INTEGER NOT NULL,
                        event_timestamp TEXT NOT NULL,
                        created_time TEXT NOT NULL,
                        invocation_id TEXT NOT NULL,
                        author TEXT NOT NULL,
                        event_data_json TEXT NOT NULL,
                        state_delta_json TEXT,
                        has_state_delta BOOLEAN NOT NULL DEFAULT 0,
                        is_after_rewind BOOLEAN NOT NULL DEFAULT 0,
                        PRIMARY KEY (app_name, user_id, session_id, event_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS app_states (
                        app_name TEXT PRIMARY KEY,
                        state_json TEXT NOT NULL,
                        update_time TEXT NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS user_states (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        state_json TEXT NOT NULL,
                        update_time TEXT NOT NULL,
                        PRIMARY KEY (app_name, user_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                Ok::<(), SessionError>(())
            })
            .await?;
        Ok(())
    }

    async fn select_session(&self, key: &SessionKey) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?")
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.map(Self::session_from_row).transpose()
    }

    async fn select_events(&self, key: &SessionKey, query: &EventQuery) -> Result<Vec<EventRow>> {
        let rows = sqlx::query("SELECT * FROM events WHERE app_name = ? AND user_id = ? AND session_id = ?")
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let rows = rows.into_iter().map(Self::event_from_row).collect::<Result<Vec<_>>>()?;
        Ok(apply_event_query(rows, query))
    }

    async fn select_sessions(&self, app_name: &str, user_id: Option<&str>) -> Result<Vec<SessionRow>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(
                    "SELECT * FROM sessions WHERE app_name = ? AND user_id = ? AND is_deleted = 0 ORDER BY update_time DESC",
                )
                .bind(app_name)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM sessions WHERE app_name = ? AND is_deleted = 0 ORDER BY update_time DESC",
                )
                .bind(app_name)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(sqlx_err)?;
        rows.into_iter().map(Self::session_from_row).collect()
    }

    async fn select_app_state(&self, app_name: &str) -> Result<HashMap<String, Value>> {
        let row = sqlx::query("SELECT state_json FROM app_states WHERE app_name = ?")
            .bind(app_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        match row {
            Some(row) => {
                let json: String = row.try_get("state_json").map_err(sqlx_err)?;
                self.decode_state(&format!("app_states/{app_name}"), &json)
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn select_user_state(&self, app_name: &str, user_id: &str) -> Result<HashMap<String, Value>> {
        let row = sqlx::query("SELECT state_json FROM user_states WHERE app_name = ? AND user_id = ?")
            .bind(app_name)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        match row {
            Some(row) => {
                let json: String = row.try_get("state_json").map_err(sqlx_err)?;
                self.decode_state(&format!("user_states/{app_name}/{user_id}"), &json)
            }
            None => Ok(HashMap::new()),
        }
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
        sqlx::query(
            r#"
            INSERT INTO sessions
                (app_name, user_id, session_id, state_json, created_time, update_time, version,
                 is_deleted, deleted_time, rewind_to_event_id, last_write_nonce)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (app_name, user_id, session_id) DO UPDATE SET
                state_json = excluded.state_json,
                created_time = excluded.created_time,
                update_time = excluded.update_time,
                version = excluded.version,
                is_deleted = excluded.is_deleted,
                deleted_time = excluded.deleted_time,
                rewind_to_event_id = excluded.rewind_to_event_id,
                last_write_nonce = excluded.last_write_nonce
            "#,
        )
        .bind(&row.app_name)
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.state_json)
        .bind(row.created_time)
        .bind(row.update_time)
        .bind(row.version)
        .bind(row.is_deleted)
        .bind(row.deleted_time)
        .bind(&row.rewind_to_event_id)
        .bind(&row.last_write_nonce)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
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
        sqlx::query(
            r#"
            UPDATE sessions SET state_json = ?, update_time = ?, version = version + 1, last_write_nonce = ?
            WHERE app_name = ? AND user_id = ? AND session_id = ? AND version = ?
            "#,
        )
        .bind(new_state_json)
        .bind(now)
        .bind(nonce)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn verify_write(&self, key: &SessionKey, expected_version_after_write: i64, nonce: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT version, last_write_nonce FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;
        let Some(row) = row else { return Ok(false) };
        let version: i64 = row.try_get("version").map_err(sqlx_err)?;
        let stored_nonce: Option<String> = row.try_get("last_write_nonce").map_err(sqlx_err)?;
        Ok(version == expected_version_after_write && stored_nonce.as_deref() == Some(nonce))
    }

    async fn soft_delete_session(&self, key: &SessionKey, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET is_deleted = 1, deleted_time = ? WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(now)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn merge_event(&self, row: &EventRow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO events
                (app_name, user_id, session_id, event_id, sequence_num, event_timestamp, created_time,
                 invocation_id, author, event_data_json, state_delta_json, has_state_delta, is_after_rewind)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (app_name, user_id, session_id, event_id) DO NOTHING
            "#,
        )
        .bind(&row.app_name)
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.event_id)
        .bind(row.sequence_num)
        .bind(row.event_timestamp)
        .bind(row.created_time)
        .bind(&row.invocation_id)
        .bind(&row.author)
        .bind(&row.event_data_json)
        .bind(&row.state_delta_json)
        .bind(row.has_state_delta)
        .bind(row.is_after_rewind)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_events_in_sequence_window(&self, key: &SessionKey, lo: i64, hi: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM events WHERE app_name = ? AND user_id = ? AND session_id = ? AND sequence_num >= ? AND sequence_num < ?",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(lo)
        .bind(hi)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;
        row.try_get::<i64, _>("n").map_err(sqlx_err)
    }

    async fn upsert_app_state(&self, app_name: &str, delta: &HashMap<String, Value>) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let current = self.select_app_state(app_name).await?;
        let next = crate::state::apply_delta(&current, delta);
        let next_json = serde_json::to_string(&next).map_err(|e| SessionError::BackendIO(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO app_states (app_name, state_json, update_time) VALUES (?, ?, ?)
            ON CONFLICT (app_name) DO UPDATE SET state_json = excluded.state_json, update_time = excluded.update_time
            "#,
        )
        .bind(app_name)
        .bind(next_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn upsert_user_state(&self, app_name: &str, user_id: &str, delta: &HashMap<String, Value>) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let current = self.select_user_state(app_name, user_id).await?;
        let next = crate::state::apply_delta(&current, delta);
        let next_json = serde_json::to_string(&next).map_err(|e| SessionError::BackendIO(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO user_states (app_name, user_id, state_json, update_time) VALUES (?, ?, ?, ?)
            ON CONFLICT (app_name, user_id) DO UPDATE SET state_json = excluded.state_json, update_time = excluded.update_time
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .bind(next_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn update_events_flag(&self, key: &SessionKey, min_sequence_exclusive: Option<i64>, value: bool) -> Result<()> {
        match min_sequence_exclusive {
            Some(min) => {
                sqlx::query(
                    "UPDATE events SET is_after_rewind = ? WHERE app_name = ? AND user_id = ? AND session_id = ? AND sequence_num > ?",
                )
                .bind(value)
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(&key.session_id)
                .bind(min)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE events SET is_after_rewind = ? WHERE app_name = ? AND user_id = ? AND session_id = ?",
                )
                .bind(value)
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(&key.session_id)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_rewind_pointer(
        &self,
        key: &SessionKey,
        state_json: &str,
        now: DateTime<Utc>,
        rewind_to_event_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET state_json = ?, update_time = ?, version = version + 1, rewind_to_event_id = ?
            WHERE app_name = ? AND user_id = ? AND session_id = ?
            "#,
        )
        .bind(state_json)
        .bind(now)
        .bind(rewind_to_event_id)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn event_sequence_num(&self, key: &SessionKey, event_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT sequence_num FROM events WHERE app_name = ? AND user_id = ? AND session_id = ? AND event_id = ?",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;
        row.map(|r| r.try_get::<i64, _>("sequence_num").map_err(sqlx_err)).transpose()
    }
}
