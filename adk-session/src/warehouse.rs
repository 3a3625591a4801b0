//! Warehouse backend: a Postgres-backed adapter via `sqlx`. This is the
//! production backend: multi-writer, OCC-critical, and the one where a
//! `Stale`/`VersionConflict` race under concurrent appends is expected
//! traffic rather than a corner case.

use crate::backend::{apply_event_query, Backend, EventQuery};
use crate::error::{Result, SessionError};
use crate::model::{EventRow, SessionKey, SessionRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::sync::OnceCell;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// A `postgres://` connection string.
    pub database_url: String,
    /// Schema the four tables live under. Interpolated directly into DDL
    /// (Postgres has no way to bind a schema name as a parameter), so it's
    /// validated against [`IDENTIFIER`] at construction rather than trusted
    /// as-is.
    pub schema: String,
    pub max_connections: u32,
}

impl WarehouseConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self { database_url: database_url.into(), schema: "public".to_string(), max_connections: 10 }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

pub struct WarehouseBackend {
    pool: PgPool,
    schema: String,
    tables_ready: OnceCell<()>,
}

impl WarehouseBackend {
    pub async fn new(config: WarehouseConfig) -> Result<Self> {
        if !IDENTIFIER.is_match(&config.schema) {
            return Err(SessionError::BackendIO(format!(
                "invalid schema identifier: {:?}",
                config.schema
            )));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| SessionError::BackendIO(e.to_string()))?;
        Ok(Self { pool, schema: config.schema, tables_ready: OnceCell::new() })
    }

    fn t(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    fn session_from_row(row: PgRow) -> Result<SessionRow> {
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

    fn event_from_row(row: PgRow) -> Result<EventRow> {
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
impl Backend for WarehouseBackend {
    async fn ensure_tables(&self) -> Result<()> {
        let schema = self.schema.clone();
        self.tables_ready
            .get_or_try_init(|| async {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                    .execute(&self.pool)
                    .await
                    .map_err(sqlx_err)?;

                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {schema}.sessions (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        state_json TEXT NOT NULL,
                        created_time TIMESTAMPTZ NOT NULL,
                        update_time TIMESTAMPTZ NOT NULL,
                        version BIGINT NOT NULL,
                        is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                        deleted_time TIMESTAMPTZ,
                        rewind_to_event_id TEXT,
                        last_write_nonce TEXT,
                        PRIMARY KEY (app_name, user_id, session_id)
                    )
                    "#
                ))
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                // Plain b-tree index on app_name: the common pruning path for
                // per-tenant scans.
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {schema}.events (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        session_id TEXT NOT NULL,
                        event_id TEXT NOT NULL,
                        sequence_num BIGINT NOT NULL,
                        event_timestamp TIMESTAMPTZ NOT NULL,
                        created_time TIMESTAMPTZ NOT NULL,
                        invocation_id TEXT NOT NULL,
                        author TEXT NOT NULL,
                        event_data_json TEXT NOT NULL,
                        state_delta_json TEXT,
                        has_state_delta BOOLEAN NOT NULL DEFAULT FALSE,
                        is_after_rewind BOOLEAN NOT NULL DEFAULT FALSE,
                        PRIMARY KEY (app_name, user_id, session_id, event_id)
                    )
                    "#
                ))
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS events_app_name_idx ON {schema}.events (app_name)"
                ))
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {schema}.app_states (
                        app_name TEXT PRIMARY KEY,
                        state_json TEXT NOT NULL,
                        update_time TIMESTAMPTZ NOT NULL
                    )
                    "#
                ))
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {schema}.user_states (
                        app_name TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        state_json TEXT NOT NULL,
                        update_time TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (app_name, user_id)
                    )
                    "#
                ))
                .execute(&self.pool)
                .await
                .map_err(sqlx_err)?;

                Ok::<(), SessionError>(())
            })
            .await?;
        Ok(())
    }

    async fn select_session(&self, key: &SessionKey) -> Result<Option<SessionRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE app_name = $1 AND user_id = $2 AND session_id = $3",
            self.t("sessions")
        );
        let row = sqlx::query(&sql)
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.map(Self::session_from_row).transpose()
    }

    async fn select_events(&self, key: &SessionKey, query: &EventQuery) -> Result<Vec<EventRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE app_name = $1 AND user_id = $2 AND session_id = $3",
            self.t("events")
        );
        let rows = sqlx::query(&sql)
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
                let sql = format!(
                    "SELECT * FROM {} WHERE app_name = $1 AND user_id = $2 AND is_deleted = FALSE ORDER BY update_time DESC",
                    self.t("sessions")
                );
                sqlx::query(&sql).bind(app_name).bind(user_id).fetch_all(&self.pool).await
            }
            None => {
                let sql = format!(
                    "SELECT * FROM {} WHERE app_name = $1 AND is_deleted = FALSE ORDER BY update_time DESC",
                    self.t("sessions")
                );
                sqlx::query(&sql).bind(app_name).fetch_all(&self.pool).await
            }
        }
        .map_err(sqlx_err)?;
        rows.into_iter().map(Self::session_from_row).collect()
    }

    async fn select_app_state(&self, app_name: &str) -> Result<HashMap<String, Value>> {
        let sql = format!("SELECT state_json FROM {} WHERE app_name = $1", self.t("app_states"));
        let row = sqlx::query(&sql).bind(app_name).fetch_optional(&self.pool).await.map_err(sqlx_err)?;
        match row {
            Some(row) => {
                let json: String = row.try_get("state_json").map_err(sqlx_err)?;
                self.decode_state(&format!("app_states/{app_name}"), &json)
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn select_user_state(&self, app_name: &str, user_id: &str) -> Result<HashMap<String, Value>> {
        let sql =
            format!("SELECT state_json FROM {} WHERE app_name = $1 AND user_id = $2", self.t("user_states"));
        let row =
            sqlx::query(&sql).bind(app_name).bind(user_id).fetch_optional(&self.pool).await.map_err(sqlx_err)?;
        match row {
            Some(row) => {
                let json: String = row.try_get("state_json").map_err(sqlx_err)?;
                self.decode_state(&format!("user_states/{app_name}/{user_id}"), &json)
            }
            None => Ok(HashMap::new()),
        }
    }

    fn decode_state(&self, context: &str, json: &str) -> Result<HashMap<String, Value>> {
        serde_json::from_str(json).map_err(|err| SessionError::Corruption {
            context: context.to_string(),
            detail: err.to_string(),
        })
    }

    async fn insert_session(&self, row: &SessionRow) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {}
                (app_name, user_id, session_id, state_json, created_time, update_time, version,
                 is_deleted, deleted_time, rewind_to_event_id, last_write_nonce)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
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
            self.t("sessions")
        );
        sqlx::query(&sql)
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
        let sql = format!(
            r#"
            UPDATE {} SET state_json = $1, update_time = $2, version = version + 1, last_write_nonce = $3
            WHERE app_name = $4 AND user_id = $5 AND session_id = $6 AND version = $7
            "#,
            self.t("sessions")
        );
        sqlx::query(&sql)
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
        let sql = format!(
            "SELECT version, last_write_nonce FROM {} WHERE app_name = $1 AND user_id = $2 AND session_id = $3",
            self.t("sessions")
        );
        let row = sqlx::query(&sql)
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
        let sql = format!(
            "UPDATE {} SET is_deleted = TRUE, deleted_time = $1 WHERE app_name = $2 AND user_id = $3 AND session_id = $4",
            self.t("sessions")
        );
        sqlx::query(&sql)
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
        // Idempotent insert: `ON CONFLICT DO NOTHING` on the event_id key,
        // no UPDATE arm since an existing row never needs to change.
        let sql = format!(
            r#"
            INSERT INTO {}
                (app_name, user_id, session_id, event_id, sequence_num, event_timestamp, created_time,
                 invocation_id, author, event_data_json, state_delta_json, has_state_delta, is_after_rewind)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (app_name, user_id, session_id, event_id) DO NOTHING
            "#,
            self.t("events")
        );
        let result = sqlx::query(&sql)
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
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE app_name = $1 AND user_id = $2 AND session_id = $3 AND sequence_num >= $4 AND sequence_num < $5",
            self.t("events")
        );
        let row = sqlx::query(&sql)
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
        let sql = format!(
            r#"
            INSERT INTO {} (app_name, state_json, update_time) VALUES ($1, $2, $3)
            ON CONFLICT (app_name) DO UPDATE SET state_json = excluded.state_json, update_time = excluded.update_time
            "#,
            self.t("app_states")
        );
        sqlx::query(&sql).bind(app_name).bind(next_json).bind(Utc::now()).execute(&self.pool).await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn upsert_user_state(&self, app_name: &str, user_id: &str, delta: &HashMap<String, Value>) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let current = self.select_user_state(app_name, user_id).await?;
        let next = crate::state::apply_delta(&current, delta);
        let next_json = serde_json::to_string(&next).map_err(|e| SessionError::BackendIO(e.to_string()))?;
        let sql = format!(
            r#"
            INSERT INTO {} (app_name, user_id, state_json, update_time) VALUES ($1, $2, $3, $4)
            ON CONFLICT (app_name, user_id) DO UPDATE SET state_json = excluded.state_json, update_time = excluded.update_time
            "#,
            self.t("user_states")
        );
        sqlx::query(&sql)
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
                let sql = format!(
                    "UPDATE {} SET is_after_rewind = $1 WHERE app_name = $2 AND user_id = $3 AND session_id = $4 AND sequence_num > $5",
                    self.t("events")
                );
                sqlx::query(&sql)
                    .bind(value)
                    .bind(&key.app_name)
                    .bind(&key.user_id)
                    .bind(&key.session_id)
                    .bind(min)
                    .execute(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET is_after_rewind = $1 WHERE app_name = $2 AND user_id = $3 AND session_id = $4",
                    self.t("events")
                );
                sqlx::query(&sql)
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
        let sql = format!(
            r#"
            UPDATE {} SET state_json = $1, update_time = $2, version = version + 1, rewind_to_event_id = $3
            WHERE app_name = $4 AND user_id = $5 AND session_id = $6
            "#,
            self.t("sessions")
        );
        sqlx::query(&sql)
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
        let sql = format!(
            "SELECT sequence_num FROM {} WHERE app_name = $1 AND user_id = $2 AND session_id = $3 AND event_id = $4",
            self.t("events")
        );
        let row = sqlx::query(&sql)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsafe_schema_identifier() {
        assert!(IDENTIFIER.is_match("public"));
        assert!(IDENTIFIER.is_match("adk_sessions"));
        assert!(!IDENTIFIER.is_match("public; DROP TABLE sessions;--"));
        assert!(!IDENTIFIER.is_match("1abc"));
    }
}
