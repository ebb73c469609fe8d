use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params_from_iter, TransactionBehavior};

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, parse_ts_opt, sql_int,
    sql_opt_text, sql_text, ts, ts_opt, Store,
};
use crate::error::CoreError;
use crate::types::{DeploymentVersion, PipelineDeployment};

const DEP_COLUMNS: &str = "id, name, pipeline_template, namespace, target_nodes, parameters,
    status, phase, current_version, created_at, updated_at, deleted_at";

const VER_COLUMNS: &str = "deployment_id, version, config_snapshot, parameters_snapshot,
    deployed_by, deployed_at, notes";

impl Store {
    /// Insert a deployment together with its version 1 snapshot, atomically.
    pub async fn create_deployment(
        &self,
        deployment: &PipelineDeployment,
        version: &DeploymentVersion,
    ) -> Result<(), CoreError> {
        let d = deployment.clone();
        let v = version.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                &format!(
                    "INSERT INTO deployments ({DEP_COLUMNS})
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
                ),
                params_from_iter(deployment_params(&d)),
            )?;
            tx.execute(
                &format!("INSERT INTO deployment_versions ({VER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
                params_from_iter(version_params(&v)),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_deployment(
        &self,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<PipelineDeployment>, CoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = if include_deleted {
                format!("SELECT {DEP_COLUMNS} FROM deployments WHERE id = ?1")
            } else {
                format!("SELECT {DEP_COLUMNS} FROM deployments WHERE id = ?1 AND deleted_at IS NULL")
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_deployment(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_deployments(
        &self,
        include_deleted: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineDeployment>, CoreError> {
        self.with_conn(move |conn| {
            let sql = if include_deleted {
                format!(
                    "SELECT {DEP_COLUMNS} FROM deployments
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                )
            } else {
                format!(
                    "SELECT {DEP_COLUMNS} FROM deployments WHERE deleted_at IS NULL
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![limit as i64, offset as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_deployment(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Replace the mutable deployment row fields (never touches versions).
    pub async fn update_deployment(&self, deployment: &PipelineDeployment) -> Result<(), CoreError> {
        let d = deployment.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE deployments SET
                    name=?2, pipeline_template=?3, namespace=?4, target_nodes=?5,
                    parameters=?6, status=?7, phase=?8, current_version=?9,
                    created_at=?10, updated_at=?11, deleted_at=?12
                 WHERE id=?1",
                params_from_iter(deployment_params(&d)),
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound(format!("deployment {}", d.id)));
            }
            Ok(())
        })
        .await
    }

    /// Append the next version snapshot and advance `current_version`, in
    /// one transaction. The version number is computed inside the
    /// transaction, so concurrent appends can never collide.
    pub async fn append_deployment_version(
        &self,
        deployment_id: &str,
        config_snapshot: serde_json::Value,
        parameters_snapshot: BTreeMap<String, String>,
        deployed_by: &str,
        notes: Option<String>,
    ) -> Result<(PipelineDeployment, DeploymentVersion), CoreError> {
        let deployment_id = deployment_id.to_string();
        let deployed_by = deployed_by.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut deployment = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {DEP_COLUMNS} FROM deployments WHERE id = ?1 AND deleted_at IS NULL"
                ))?;
                let mut rows = stmt.query(rusqlite::params![deployment_id])?;
                match rows.next()? {
                    Some(row) => row_to_deployment(row)?,
                    None => {
                        return Err(CoreError::NotFound(format!("deployment {deployment_id}")))
                    }
                }
            };
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM deployment_versions
                 WHERE deployment_id = ?1",
                rusqlite::params![deployment_id],
                |row| row.get(0),
            )?;
            let version = DeploymentVersion {
                deployment_id: deployment_id.clone(),
                version: next,
                config_snapshot,
                parameters_snapshot,
                deployed_by,
                deployed_at: Utc::now(),
                notes,
            };
            tx.execute(
                &format!("INSERT INTO deployment_versions ({VER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
                params_from_iter(version_params(&version)),
            )?;
            deployment.current_version = next;
            deployment.updated_at = Utc::now();
            tx.execute(
                "UPDATE deployments SET current_version=?2, updated_at=?3 WHERE id=?1",
                rusqlite::params![deployment_id, next, ts(deployment.updated_at)],
            )?;
            tx.commit()?;
            Ok((deployment, version))
        })
        .await
    }

    pub async fn get_deployment_version(
        &self,
        deployment_id: &str,
        version: i64,
    ) -> Result<Option<DeploymentVersion>, CoreError> {
        let deployment_id = deployment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VER_COLUMNS} FROM deployment_versions
                 WHERE deployment_id = ?1 AND version = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![deployment_id, version])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_version(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// All versions of a deployment, newest first.
    pub async fn list_deployment_versions(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentVersion>, CoreError> {
        let deployment_id = deployment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VER_COLUMNS} FROM deployment_versions
                 WHERE deployment_id = ?1 ORDER BY version DESC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![deployment_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_version(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Soft-delete: hidden from default listings, retained for audit.
    pub async fn soft_delete_deployment(&self, id: &str) -> Result<PipelineDeployment, CoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let mut stmt = conn.prepare(&format!(
                "UPDATE deployments SET deleted_at=?2, status='inactive', updated_at=?2
                 WHERE id=?1 AND deleted_at IS NULL
                 RETURNING {DEP_COLUMNS}"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id, ts(now)])?;
            match rows.next()? {
                Some(row) => Ok(row_to_deployment(row)?),
                None => Err(CoreError::NotFound(format!("deployment {id}"))),
            }
        })
        .await
    }
}

fn deployment_params(d: &PipelineDeployment) -> Vec<super::SqlValue> {
    vec![
        sql_text(&*d.id),
        sql_text(&*d.name),
        sql_text(&*d.pipeline_template),
        sql_text(&*d.namespace),
        sql_text(json_to_sql(&d.target_nodes)),
        sql_text(json_to_sql(&d.parameters)),
        sql_text(enum_to_sql(&d.status)),
        sql_text(enum_to_sql(&d.phase)),
        sql_int(d.current_version),
        sql_text(ts(d.created_at)),
        sql_text(ts(d.updated_at)),
        sql_opt_text(ts_opt(d.deleted_at)),
    ]
}

fn version_params(v: &DeploymentVersion) -> Vec<super::SqlValue> {
    vec![
        sql_text(&*v.deployment_id),
        sql_int(v.version),
        sql_text(v.config_snapshot.to_string()),
        sql_text(json_to_sql(&v.parameters_snapshot)),
        sql_text(&*v.deployed_by),
        sql_text(ts(v.deployed_at)),
        sql_opt_text(v.notes.clone()),
    ]
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineDeployment> {
    let target_nodes: String = row.get(4)?;
    let parameters: String = row.get(5)?;
    let status: String = row.get(6)?;
    let phase: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let deleted_at: Option<String> = row.get(11)?;

    Ok(PipelineDeployment {
        id: row.get(0)?,
        name: row.get(1)?,
        pipeline_template: row.get(2)?,
        namespace: row.get(3)?,
        target_nodes: json_from_sql(&target_nodes),
        parameters: json_from_sql(&parameters),
        status: enum_from_sql(&status),
        phase: enum_from_sql(&phase),
        current_version: row.get(8)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        deleted_at: parse_ts_opt(deleted_at),
    })
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentVersion> {
    let config_snapshot: String = row.get(2)?;
    let parameters_snapshot: String = row.get(3)?;
    let deployed_at: String = row.get(5)?;

    Ok(DeploymentVersion {
        deployment_id: row.get(0)?,
        version: row.get(1)?,
        config_snapshot: serde_json::from_str(&config_snapshot).expect("valid json"),
        parameters_snapshot: json_from_sql(&parameters_snapshot),
        deployed_by: row.get(4)?,
        deployed_at: parse_ts(&deployed_at),
        notes: row.get(6)?,
    })
}
