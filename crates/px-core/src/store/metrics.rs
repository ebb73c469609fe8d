use chrono::{DateTime, Utc};

use super::{enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, ts, Store};
use crate::error::CoreError;
use crate::types::{MetricSample, Variant};

const COLUMNS: &str =
    "experiment_id, variant, host_id, timestamp, cardinality, cost_per_minute, dropped_count, extra";

impl Store {
    /// Append a batch of samples in one transaction.
    pub async fn insert_metric_samples(&self, samples: Vec<MetricSample>) -> Result<(), CoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO metric_samples ({COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"
                ))?;
                for s in &samples {
                    stmt.execute(rusqlite::params![
                        s.experiment_id,
                        enum_to_sql(&s.variant),
                        s.host_id,
                        ts(s.timestamp),
                        s.cardinality as i64,
                        s.cost_per_minute,
                        s.dropped_count as i64,
                        json_to_sql(&s.extra),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// All samples for one variant of an experiment, oldest first.
    pub async fn list_metric_samples(
        &self,
        experiment_id: &str,
        variant: Variant,
    ) -> Result<Vec<MetricSample>, CoreError> {
        let experiment_id = experiment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM metric_samples
                 WHERE experiment_id = ?1 AND variant = ?2
                 ORDER BY timestamp ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![experiment_id, enum_to_sql(&variant)])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_sample(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn count_metric_samples(&self, experiment_id: &str) -> Result<u64, CoreError> {
        let experiment_id = experiment_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM metric_samples WHERE experiment_id = ?1",
                rusqlite::params![experiment_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Administrative prune: drop samples older than `cutoff` belonging to
    /// terminal experiments. Returns the number of rows removed.
    pub async fn prune_metric_samples(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM metric_samples
                 WHERE timestamp < ?1
                   AND experiment_id IN (
                     SELECT id FROM experiments
                     WHERE phase IN ('completed','failed','cancelled')
                   )",
                rusqlite::params![ts(cutoff)],
            )?;
            Ok(deleted as u64)
        })
        .await
    }
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSample> {
    let variant: String = row.get(1)?;
    let timestamp: String = row.get(3)?;
    let cardinality: i64 = row.get(4)?;
    let dropped_count: i64 = row.get(6)?;
    let extra: String = row.get(7)?;

    Ok(MetricSample {
        experiment_id: row.get(0)?,
        variant: enum_from_sql(&variant),
        host_id: row.get(2)?,
        timestamp: parse_ts(&timestamp),
        cardinality: cardinality as u64,
        cost_per_minute: row.get(5)?,
        dropped_count: dropped_count as u64,
        extra: json_from_sql(&extra),
    })
}
