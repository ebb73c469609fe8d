use chrono::{DateTime, Utc};

use super::{parse_ts, ts, Store};
use crate::error::CoreError;
use crate::types::RevokedToken;

impl Store {
    /// Record a revoked JWT id until its natural expiry.
    pub async fn revoke_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), CoreError> {
        let jti = jti.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO revoked_tokens (jti, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(jti) DO UPDATE SET expires_at=excluded.expires_at",
                rusqlite::params![jti, ts(expires_at)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn is_token_revoked(&self, jti: &str) -> Result<bool, CoreError> {
        let jti = jti.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM revoked_tokens WHERE jti = ?1",
                rusqlite::params![jti],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// Delete revocation rows whose token has expired anyway. Returns the
    /// number of rows removed.
    pub async fn sweep_revoked_tokens(&self) -> Result<u64, CoreError> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM revoked_tokens WHERE expires_at < ?1",
                rusqlite::params![ts(Utc::now())],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    pub async fn list_revoked_tokens(&self) -> Result<Vec<RevokedToken>, CoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT jti, expires_at FROM revoked_tokens ORDER BY expires_at")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let expires_at: String = row.get(1)?;
                out.push(RevokedToken {
                    jti: row.get(0)?,
                    expires_at: parse_ts(&expires_at),
                });
            }
            Ok(out)
        })
        .await
    }
}
