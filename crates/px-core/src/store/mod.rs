//! SQLite-backed storage for the control plane.
//!
//! All access flows through one serialized [`tokio_rusqlite::Connection`];
//! multi-step mutations run inside an IMMEDIATE transaction in a single
//! `call` closure, so partial updates are impossible and guarded updates
//! (lease dequeue, phase transitions) are atomic with respect to every
//! other caller.

mod agents;
mod deployments;
mod experiments;
mod metrics;
mod migrations;
mod tasks;
mod tokens;

pub use tasks::ReapOutcome;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;

use crate::error::CoreError;

/// Async SQLite store for experiments, deployments, tasks, agents, metric
/// samples, and revoked tokens.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path and apply any
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), CoreError> {
        self.conn
            .call(|conn| {
                migrations::apply_pending(conn)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Migration versions currently applied, ascending.
    pub async fn applied_migrations(&self) -> Result<Vec<i64>, CoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
                let versions = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(versions)
            })
            .await
            .map_err(Into::into)
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), CoreError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Run `f` on the serialized connection, mapping both transport and
    /// domain errors into [`CoreError`]. Entity modules build every accessor
    /// on top of this.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, CoreError> + Send + 'static,
    {
        self.conn.call(move |conn| Ok(f(conn))).await?
    }
}

// ---------------------------------------------------------------------------
// Column mapping helpers shared by the entity modules
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{raw}\"");
    serde_json::from_str(&quoted).expect("deserialize enum")
}

/// Fixed-width UTC timestamp so lexicographic ordering in SQL matches
/// chronological ordering.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

pub(crate) fn json_to_sql<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_string(val).expect("serialize json column")
}

pub(crate) fn json_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    serde_json::from_str(raw).expect("deserialize json column")
}

// Owned parameter values, so row helpers can build full binding sets
// without borrowing temporaries. Bound positionally via `params_from_iter`.
pub(crate) type SqlValue = rusqlite::types::Value;

pub(crate) fn sql_text(v: impl Into<String>) -> SqlValue {
    SqlValue::Text(v.into())
}

pub(crate) fn sql_opt_text(v: Option<String>) -> SqlValue {
    v.map(SqlValue::Text).unwrap_or(SqlValue::Null)
}

pub(crate) fn sql_int(v: i64) -> SqlValue {
    SqlValue::Integer(v)
}
