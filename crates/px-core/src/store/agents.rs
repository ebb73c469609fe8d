use chrono::Utc;
use rusqlite::params_from_iter;

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, parse_ts, sql_opt_text, sql_text, ts,
    Store,
};
use crate::error::CoreError;
use crate::types::{Agent, AgentStatus, CollectorInfo};

const COLUMNS: &str =
    "host_id, hostname, capabilities, status, last_heartbeat_at, collector_info, metadata";

impl Store {
    /// Insert-or-update the full agent row (first contact registers).
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), CoreError> {
        let a = agent.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO agents ({COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(host_id) DO UPDATE SET
                        hostname=excluded.hostname, capabilities=excluded.capabilities,
                        status=excluded.status, last_heartbeat_at=excluded.last_heartbeat_at,
                        collector_info=excluded.collector_info, metadata=excluded.metadata"
                ),
                params_from_iter(agent_params(&a)),
            )?;
            Ok(())
        })
        .await
    }

    /// Refresh an agent's heartbeat, marking it online. Creates the row on
    /// first contact. Optional fields update only when provided. Returns
    /// the refreshed row plus the prior status (`None` on first contact)
    /// so callers can announce unregistered/offline -> online transitions.
    pub async fn touch_agent(
        &self,
        host_id: &str,
        capabilities: Option<Vec<String>>,
        collector_info: Option<CollectorInfo>,
    ) -> Result<(Agent, Option<AgentStatus>), CoreError> {
        let host_id = host_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let existing = {
                let mut stmt =
                    conn.prepare(&format!("SELECT {COLUMNS} FROM agents WHERE host_id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![host_id])?;
                match rows.next()? {
                    Some(row) => Some(row_to_agent(row)?),
                    None => None,
                }
            };
            let prior_status = existing.as_ref().map(|a| a.status);
            let mut agent = existing.unwrap_or_else(|| Agent::new(host_id.clone()));
            agent.status = AgentStatus::Online;
            agent.last_heartbeat_at = now;
            if let Some(capabilities) = capabilities {
                agent.capabilities = capabilities;
            }
            if let Some(info) = collector_info {
                agent.collector_info = Some(info);
            }
            conn.execute(
                &format!(
                    "INSERT INTO agents ({COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(host_id) DO UPDATE SET
                        hostname=excluded.hostname, capabilities=excluded.capabilities,
                        status=excluded.status, last_heartbeat_at=excluded.last_heartbeat_at,
                        collector_info=excluded.collector_info, metadata=excluded.metadata"
                ),
                params_from_iter(agent_params(&agent)),
            )?;
            Ok((agent, prior_status))
        })
        .await
    }

    pub async fn get_agent(&self, host_id: &str) -> Result<Option<Agent>, CoreError> {
        let host_id = host_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM agents WHERE host_id = ?1"))?;
            let mut rows = stmt.query(rusqlite::params![host_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_agent(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, CoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM agents ORDER BY host_id"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_agent(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Recompute every agent's status from heartbeat age and persist the
    /// ones that changed. Returns the transitions for event emission.
    pub async fn refresh_agent_liveness(
        &self,
        degraded_after_secs: i64,
        offline_after_secs: i64,
    ) -> Result<Vec<(Agent, AgentStatus)>, CoreError> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            let agents = {
                let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM agents"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                out
            };
            let mut transitions = Vec::new();
            for agent in agents {
                let derived = agent.derived_status(now, degraded_after_secs, offline_after_secs);
                if derived != agent.status {
                    conn.execute(
                        "UPDATE agents SET status = ?2 WHERE host_id = ?1",
                        rusqlite::params![agent.host_id, enum_to_sql(&derived)],
                    )?;
                    transitions.push((agent, derived));
                }
            }
            Ok(transitions)
        })
        .await
    }
}

fn agent_params(a: &Agent) -> Vec<super::SqlValue> {
    vec![
        sql_text(&*a.host_id),
        sql_text(&*a.hostname),
        sql_text(json_to_sql(&a.capabilities)),
        sql_text(enum_to_sql(&a.status)),
        sql_text(ts(a.last_heartbeat_at)),
        sql_opt_text(a.collector_info.as_ref().map(json_to_sql)),
        sql_text(json_to_sql(&a.metadata)),
    ]
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let capabilities: String = row.get(2)?;
    let status: String = row.get(3)?;
    let last_heartbeat_at: String = row.get(4)?;
    let collector_info: Option<String> = row.get(5)?;
    let metadata: String = row.get(6)?;

    Ok(Agent {
        host_id: row.get(0)?,
        hostname: row.get(1)?,
        capabilities: json_from_sql(&capabilities),
        status: enum_from_sql(&status),
        last_heartbeat_at: parse_ts(&last_heartbeat_at),
        collector_info: collector_info.map(|s| json_from_sql(&s)),
        metadata: json_from_sql(&metadata),
    })
}
