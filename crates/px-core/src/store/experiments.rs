use rusqlite::{params_from_iter, TransactionBehavior};

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, parse_ts_opt, sql_int,
    sql_opt_text, sql_text, ts, ts_opt, Store,
};
use crate::error::CoreError;
use crate::types::{Experiment, ExperimentPhase};

const COLUMNS: &str = "id, name, description, phase, baseline_pipeline, candidate_pipeline,
    target_hosts, selectors, parameters, duration_secs, success_criteria,
    created_at, updated_at, started_at, completed_at, analyzing_since,
    results, failure_reason, promoted_deployment_id";

impl Store {
    pub async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), CoreError> {
        let e = experiment.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO experiments ({COLUMNS})
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)"
                ),
                params_from_iter(experiment_params(&e)),
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, CoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM experiments WHERE id = ?1"))?;
            let mut rows = stmt.query(rusqlite::params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_experiment(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_experiments(
        &self,
        phase: Option<ExperimentPhase>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Experiment>, CoreError> {
        self.with_conn(move |conn| {
            let mut out = Vec::new();
            match phase {
                Some(phase) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM experiments WHERE phase = ?1
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![
                        enum_to_sql(&phase),
                        limit as i64,
                        offset as i64
                    ])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_experiment(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM experiments
                         ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![limit as i64, offset as i64])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_experiment(row)?);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    /// Experiments currently in the given phase (no paging; loop use).
    pub async fn experiments_in_phase(
        &self,
        phase: ExperimentPhase,
    ) -> Result<Vec<Experiment>, CoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM experiments WHERE phase = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![enum_to_sql(&phase)])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_experiment(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Replace the full experiment row (phase-unchecked; callers that
    /// transition the state machine use [`Store::update_experiment_guarded`]).
    pub async fn update_experiment(&self, experiment: &Experiment) -> Result<(), CoreError> {
        let e = experiment.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE experiments SET
                    name=?2, description=?3, phase=?4, baseline_pipeline=?5,
                    candidate_pipeline=?6, target_hosts=?7, selectors=?8, parameters=?9,
                    duration_secs=?10, success_criteria=?11, created_at=?12, updated_at=?13,
                    started_at=?14, completed_at=?15, analyzing_since=?16, results=?17,
                    failure_reason=?18, promoted_deployment_id=?19
                 WHERE id=?1",
                params_from_iter(experiment_params(&e)),
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound(format!("experiment {}", e.id)));
            }
            Ok(())
        })
        .await
    }

    /// Atomically re-read the experiment, assert its phase is one of
    /// `expected`, apply `mutate`, and persist — all inside one IMMEDIATE
    /// transaction. This is the only correct way to transition the state
    /// machine under concurrency.
    pub async fn update_experiment_guarded<F>(
        &self,
        id: &str,
        expected: Vec<ExperimentPhase>,
        mutate: F,
    ) -> Result<Experiment, CoreError>
    where
        F: FnOnce(&mut Experiment) -> Result<(), CoreError> + Send + 'static,
    {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut experiment = {
                let mut stmt =
                    tx.prepare(&format!("SELECT {COLUMNS} FROM experiments WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => row_to_experiment(row)?,
                    None => return Err(CoreError::NotFound(format!("experiment {id}"))),
                }
            };
            if !expected.is_empty() && !expected.contains(&experiment.phase) {
                return Err(CoreError::StateMachineViolation(format!(
                    "experiment {id} is {}, expected one of {:?}",
                    enum_to_sql(&experiment.phase),
                    expected.iter().map(enum_to_sql).collect::<Vec<_>>()
                )));
            }
            mutate(&mut experiment)?;
            experiment.updated_at = chrono::Utc::now();
            tx.execute(
                "UPDATE experiments SET
                    name=?2, description=?3, phase=?4, baseline_pipeline=?5,
                    candidate_pipeline=?6, target_hosts=?7, selectors=?8, parameters=?9,
                    duration_secs=?10, success_criteria=?11, created_at=?12, updated_at=?13,
                    started_at=?14, completed_at=?15, analyzing_since=?16, results=?17,
                    failure_reason=?18, promoted_deployment_id=?19
                 WHERE id=?1",
                params_from_iter(experiment_params(&experiment)),
            )?;
            tx.commit()?;
            Ok(experiment)
        })
        .await
    }

    /// Hard-delete an experiment and cancel-cascade is handled by the
    /// caller (engine cancels owned tasks first).
    pub async fn delete_experiment(&self, id: &str) -> Result<(), CoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM experiments WHERE id = ?1", [&id])?;
            if changed == 0 {
                return Err(CoreError::NotFound(format!("experiment {id}")));
            }
            Ok(())
        })
        .await
    }
}

fn experiment_params(e: &Experiment) -> Vec<super::SqlValue> {
    vec![
        sql_text(&*e.id),
        sql_text(&*e.name),
        sql_opt_text(e.description.clone()),
        sql_text(enum_to_sql(&e.phase)),
        sql_text(&*e.baseline_pipeline),
        sql_text(&*e.candidate_pipeline),
        sql_text(json_to_sql(&e.target_hosts)),
        sql_text(json_to_sql(&e.selectors)),
        sql_text(json_to_sql(&e.parameters)),
        sql_int(e.duration_secs as i64),
        sql_text(json_to_sql(&e.success_criteria)),
        sql_text(ts(e.created_at)),
        sql_text(ts(e.updated_at)),
        sql_opt_text(ts_opt(e.started_at)),
        sql_opt_text(ts_opt(e.completed_at)),
        sql_opt_text(ts_opt(e.analyzing_since)),
        sql_opt_text(e.results.as_ref().map(json_to_sql)),
        sql_opt_text(e.failure_reason.clone()),
        sql_opt_text(e.promoted_deployment_id.clone()),
    ]
}

fn row_to_experiment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let phase: String = row.get(3)?;
    let target_hosts: String = row.get(6)?;
    let selectors: String = row.get(7)?;
    let parameters: String = row.get(8)?;
    let duration_secs: i64 = row.get(9)?;
    let success_criteria: String = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let started_at: Option<String> = row.get(13)?;
    let completed_at: Option<String> = row.get(14)?;
    let analyzing_since: Option<String> = row.get(15)?;
    let results: Option<String> = row.get(16)?;

    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        phase: enum_from_sql(&phase),
        baseline_pipeline: row.get(4)?,
        candidate_pipeline: row.get(5)?,
        target_hosts: json_from_sql(&target_hosts),
        selectors: json_from_sql(&selectors),
        parameters: json_from_sql(&parameters),
        duration_secs: duration_secs as u64,
        success_criteria: json_from_sql(&success_criteria),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        started_at: parse_ts_opt(started_at),
        completed_at: parse_ts_opt(completed_at),
        analyzing_since: parse_ts_opt(analyzing_since),
        results: results.map(|s| json_from_sql(&s)),
        failure_reason: row.get(17)?,
        promoted_deployment_id: row.get(18)?,
    })
}
