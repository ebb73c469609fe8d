use chrono::{Duration, Utc};
use rusqlite::{params_from_iter, TransactionBehavior};

use super::{
    enum_from_sql, enum_to_sql, parse_ts, parse_ts_opt, sql_int, sql_opt_text, sql_text, ts,
    ts_opt, Store,
};
use crate::error::CoreError;
use crate::types::Task;

const COLUMNS: &str = "id, type, target_host_id, priority, payload, experiment_id, deployment_id,
    status, attempts, max_attempts, not_before, lease_expires_at, leased_by,
    created_at, updated_at, last_error, result";

/// Tasks touched by a reaper pass, split by outcome.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Lease expired with attempts remaining; now `pending` again.
    pub requeued: Vec<Task>,
    /// Lease expired with attempts exhausted; now `failed`.
    pub failed: Vec<Task>,
}

impl Store {
    pub async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        let t = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({COLUMNS})
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)"
                ),
                params_from_iter(task_params(&t)),
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"))?;
            let mut rows = stmt.query(rusqlite::params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_task(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Atomically lease the single best dispatchable task for an agent.
    ///
    /// `targets` is the set of `target_host_id` values the agent can serve:
    /// its own host id plus one `cap:<capability>` entry per advertised
    /// capability. Selection order is priority descending, then the
    /// effective dispatch time (`not_before`, falling back to `created_at`)
    /// ascending, then id ascending. The whole selection+claim is a single
    /// `UPDATE … RETURNING` statement on the serialized connection, so two
    /// concurrent agents can never claim the same row.
    pub async fn dequeue_task(
        &self,
        agent_host_id: &str,
        targets: Vec<String>,
        lease_duration: Duration,
    ) -> Result<Option<Task>, CoreError> {
        if targets.is_empty() {
            return Ok(None);
        }
        let agent = agent_host_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let placeholders = (0..targets.len())
                .map(|i| format!("?{}", i + 4))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE tasks SET
                    status='leased', leased_by=?1, lease_expires_at=?2,
                    attempts=attempts+1, updated_at=?3
                 WHERE id = (
                    SELECT id FROM tasks
                    WHERE status='pending'
                      AND attempts < max_attempts
                      AND (not_before IS NULL OR not_before <= ?3)
                      AND target_host_id IN ({placeholders})
                    ORDER BY priority DESC,
                             COALESCE(not_before, created_at) ASC,
                             id ASC
                    LIMIT 1
                 )
                 RETURNING {COLUMNS}"
            );
            let mut params = vec![
                sql_text(agent.clone()),
                sql_text(ts(now + lease_duration)),
                sql_text(ts(now)),
            ];
            for target in &targets {
                params.push(sql_text(&**target));
            }
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params))?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_task(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Extend the lease on a task the agent still holds.
    pub async fn extend_lease(
        &self,
        task_id: &str,
        agent_host_id: &str,
        lease_duration: Duration,
    ) -> Result<Task, CoreError> {
        let task_id = task_id.to_string();
        let agent = agent_host_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let mut stmt = conn.prepare(&format!(
                "UPDATE tasks SET lease_expires_at=?3, updated_at=?4
                 WHERE id=?1 AND status='leased' AND leased_by=?2
                 RETURNING {COLUMNS}"
            ))?;
            let mut rows = stmt.query(rusqlite::params![
                task_id,
                agent,
                ts(now + lease_duration),
                ts(now)
            ])?;
            match rows.next()? {
                Some(row) => Ok(row_to_task(row)?),
                None => Err(lease_refused(conn, &task_id)?),
            }
        })
        .await
    }

    /// Transition a leased task to `succeeded`, recording the result.
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_host_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Task, CoreError> {
        let task_id = task_id.to_string();
        let agent = agent_host_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE tasks SET status='succeeded', result=?3, lease_expires_at=NULL,
                        updated_at=?4
                 WHERE id=?1 AND status='leased' AND leased_by=?2
                 RETURNING {COLUMNS}"
            ))?;
            let mut rows = stmt.query(rusqlite::params![
                task_id,
                agent,
                result.map(|r| r.to_string()),
                ts(Utc::now())
            ])?;
            match rows.next()? {
                Some(row) => Ok(row_to_task(row)?),
                None => Err(lease_refused(conn, &task_id)?),
            }
        })
        .await
    }

    /// Record a failure. Retriable failures with attempts remaining go back
    /// to `pending` with an exponential `not_before` backoff; everything
    /// else lands in terminal `failed`.
    pub async fn fail_task(
        &self,
        task_id: &str,
        agent_host_id: &str,
        error: &str,
        retriable: bool,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<Task, CoreError> {
        let task_id = task_id.to_string();
        let agent = agent_host_id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {COLUMNS} FROM tasks
                     WHERE id=?1 AND status='leased' AND leased_by=?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![task_id, agent])?;
                match rows.next()? {
                    Some(row) => row_to_task(row)?,
                    None => return Err(lease_refused(&tx, &task_id)?),
                }
            };

            let now = Utc::now();
            let updated = if retriable && task.attempts < task.max_attempts {
                let not_before = now + backoff(task.attempts, backoff_base, backoff_cap);
                let mut stmt = tx.prepare(&format!(
                    "UPDATE tasks SET status='pending', not_before=?2, last_error=?3,
                            lease_expires_at=NULL, leased_by=NULL, updated_at=?4
                     WHERE id=?1
                     RETURNING {COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![
                    task_id,
                    ts(not_before),
                    error,
                    ts(now)
                ])?;
                let row = rows.next()?.expect("row just selected");
                row_to_task(row)?
            } else {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE tasks SET status='failed', last_error=?2,
                            lease_expires_at=NULL, updated_at=?3
                     WHERE id=?1
                     RETURNING {COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![task_id, error, ts(now)])?;
                let row = rows.next()?.expect("row just selected");
                row_to_task(row)?
            };
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Idempotent cancel: non-terminal tasks transition to `cancelled`;
    /// terminal tasks are returned unchanged.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, CoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE tasks SET status='cancelled', lease_expires_at=NULL, leased_by=NULL,
                        updated_at=?2
                 WHERE id=?1 AND status IN ('pending','leased')
                 RETURNING {COLUMNS}"
            ))?;
            let mut rows = stmt.query(rusqlite::params![task_id, ts(Utc::now())])?;
            if let Some(row) = rows.next()? {
                return Ok(row_to_task(row)?);
            }
            drop(rows);
            drop(stmt);
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM tasks WHERE id=?1"))?;
            let mut rows = stmt.query(rusqlite::params![task_id])?;
            match rows.next()? {
                Some(row) => Ok(row_to_task(row)?),
                None => Err(CoreError::NotFound(format!("task {task_id}"))),
            }
        })
        .await
    }

    /// Cancel every non-terminal task owned by an experiment.
    pub async fn cancel_tasks_for_experiment(&self, experiment_id: &str) -> Result<u64, CoreError> {
        let experiment_id = experiment_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status='cancelled', lease_expires_at=NULL, leased_by=NULL,
                        updated_at=?2
                 WHERE experiment_id=?1 AND status IN ('pending','leased')",
                rusqlite::params![experiment_id, ts(Utc::now())],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    /// Return every expired lease to `pending` (attempts remaining) or
    /// `failed` (exhausted). One transaction; invoked by the reaper loop.
    pub async fn reap_expired_leases(&self) -> Result<ReapOutcome, CoreError> {
        self.with_conn(move |conn| {
            let now = ts(Utc::now());
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut outcome = ReapOutcome::default();
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE tasks SET status='pending', lease_expires_at=NULL, leased_by=NULL,
                            last_error='lease expired', updated_at=?1
                     WHERE status='leased' AND lease_expires_at < ?1
                       AND attempts < max_attempts
                     RETURNING {COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![now])?;
                while let Some(row) = rows.next()? {
                    outcome.requeued.push(row_to_task(row)?);
                }
            }
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE tasks SET status='failed', lease_expires_at=NULL,
                            last_error='lease expired; attempts exhausted', updated_at=?1
                     WHERE status='leased' AND lease_expires_at < ?1
                     RETURNING {COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![now])?;
                while let Some(row) = rows.next()? {
                    outcome.failed.push(row_to_task(row)?);
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    pub async fn list_tasks_for_host(&self, host_id: &str) -> Result<Vec<Task>, CoreError> {
        let host_id = host_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE target_host_id = ?1 OR leased_by = ?1
                 ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![host_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_task(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn list_tasks_for_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<Task>, CoreError> {
        let experiment_id = experiment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE experiment_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![experiment_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_task(row)?);
            }
            Ok(out)
        })
        .await
    }
}

/// Exponential backoff for attempt `n` (1-based): `base * 2^(n-1)`, capped.
fn backoff(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    let scaled = base * 2_i32.saturating_pow(shift);
    scaled.min(cap)
}

// Classify a refused guarded update: missing row vs lost lease.
fn lease_refused(conn: &rusqlite::Connection, task_id: &str) -> rusqlite::Result<CoreError> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM tasks WHERE id = ?1",
            rusqlite::params![task_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)?;
    Ok(if exists {
        CoreError::LeaseLost {
            task_id: task_id.to_string(),
        }
    } else {
        CoreError::NotFound(format!("task {task_id}"))
    })
}

fn task_params(t: &Task) -> Vec<super::SqlValue> {
    vec![
        sql_text(&*t.id),
        sql_text(enum_to_sql(&t.task_type)),
        sql_text(&*t.target_host_id),
        sql_int(t.priority as i64),
        sql_text(t.payload.to_string()),
        sql_opt_text(t.experiment_id.clone()),
        sql_opt_text(t.deployment_id.clone()),
        sql_text(enum_to_sql(&t.status)),
        sql_int(t.attempts as i64),
        sql_int(t.max_attempts as i64),
        sql_opt_text(ts_opt(t.not_before)),
        sql_opt_text(ts_opt(t.lease_expires_at)),
        sql_opt_text(t.leased_by.clone()),
        sql_text(ts(t.created_at)),
        sql_text(ts(t.updated_at)),
        sql_opt_text(t.last_error.clone()),
        sql_opt_text(t.result.as_ref().map(|r| r.to_string())),
    ]
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(1)?;
    let payload: String = row.get(4)?;
    let status: String = row.get(7)?;
    let not_before: Option<String> = row.get(10)?;
    let lease_expires_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let result: Option<String> = row.get(16)?;

    Ok(Task {
        id: row.get(0)?,
        task_type: enum_from_sql(&task_type),
        target_host_id: row.get(2)?,
        priority: row.get(3)?,
        payload: serde_json::from_str(&payload).expect("valid json"),
        experiment_id: row.get(5)?,
        deployment_id: row.get(6)?,
        status: enum_from_sql(&status),
        attempts: row.get(8)?,
        max_attempts: row.get(9)?,
        not_before: parse_ts_opt(not_before),
        lease_expires_at: parse_ts_opt(lease_expires_at),
        leased_by: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_error: row.get(15)?,
        result: result.map(|r| serde_json::from_str(&r).expect("valid json")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::seconds(5);
        let cap = Duration::seconds(300);
        assert_eq!(backoff(1, base, cap), Duration::seconds(5));
        assert_eq!(backoff(2, base, cap), Duration::seconds(10));
        assert_eq!(backoff(3, base, cap), Duration::seconds(20));
        assert_eq!(backoff(8, base, cap), Duration::seconds(300));
        assert_eq!(backoff(32, base, cap), Duration::seconds(300));
    }
}
