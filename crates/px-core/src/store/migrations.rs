//! Versioned startup migrations. Each entry runs at most once, inside a
//! transaction, and is recorded in `schema_migrations`.

use rusqlite::Connection;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE experiments (
            id                      TEXT PRIMARY KEY,
            name                    TEXT NOT NULL,
            description             TEXT,
            phase                   TEXT NOT NULL,
            baseline_pipeline       TEXT NOT NULL,
            candidate_pipeline      TEXT NOT NULL,
            target_hosts            TEXT NOT NULL,
            selectors               TEXT NOT NULL,
            parameters              TEXT NOT NULL,
            duration_secs           INTEGER NOT NULL,
            success_criteria        TEXT NOT NULL,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL,
            started_at              TEXT,
            completed_at            TEXT,
            analyzing_since         TEXT,
            results                 TEXT,
            failure_reason          TEXT,
            promoted_deployment_id  TEXT
        );

        CREATE INDEX idx_experiments_phase ON experiments(phase);
        ",
    ),
    (
        2,
        "
        CREATE TABLE deployments (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            pipeline_template TEXT NOT NULL,
            namespace         TEXT NOT NULL,
            target_nodes      TEXT NOT NULL,
            parameters        TEXT NOT NULL,
            status            TEXT NOT NULL,
            phase             TEXT NOT NULL,
            current_version   INTEGER NOT NULL,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            deleted_at        TEXT
        );

        CREATE TABLE deployment_versions (
            deployment_id       TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            version             INTEGER NOT NULL,
            config_snapshot     TEXT NOT NULL,
            parameters_snapshot TEXT NOT NULL,
            deployed_by         TEXT NOT NULL,
            deployed_at         TEXT NOT NULL,
            notes               TEXT,
            PRIMARY KEY (deployment_id, version)
        );
        ",
    ),
    (
        3,
        "
        CREATE TABLE tasks (
            id               TEXT PRIMARY KEY,
            type             TEXT NOT NULL,
            target_host_id   TEXT NOT NULL,
            priority         INTEGER NOT NULL DEFAULT 0,
            payload          TEXT NOT NULL,
            experiment_id    TEXT,
            deployment_id    TEXT,
            status           TEXT NOT NULL,
            attempts         INTEGER NOT NULL DEFAULT 0,
            max_attempts     INTEGER NOT NULL DEFAULT 3,
            not_before       TEXT,
            lease_expires_at TEXT,
            leased_by        TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            last_error       TEXT,
            result           TEXT
        );

        CREATE INDEX idx_tasks_dispatch ON tasks(status, target_host_id);
        CREATE INDEX idx_tasks_experiment ON tasks(experiment_id);
        ",
    ),
    (
        4,
        "
        CREATE TABLE agents (
            host_id           TEXT PRIMARY KEY,
            hostname          TEXT NOT NULL,
            capabilities      TEXT NOT NULL,
            status            TEXT NOT NULL,
            last_heartbeat_at TEXT NOT NULL,
            collector_info    TEXT,
            metadata          TEXT NOT NULL
        );

        CREATE INDEX idx_agents_status ON agents(status);
        ",
    ),
    (
        5,
        "
        CREATE TABLE metric_samples (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_id   TEXT NOT NULL,
            variant         TEXT NOT NULL,
            host_id         TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            cardinality     INTEGER NOT NULL,
            cost_per_minute REAL NOT NULL,
            dropped_count   INTEGER NOT NULL,
            extra           TEXT NOT NULL
        );

        CREATE INDEX idx_samples_experiment ON metric_samples(experiment_id, variant);
        ",
    ),
    (
        6,
        "
        CREATE TABLE revoked_tokens (
            jti        TEXT PRIMARY KEY,
            expires_at TEXT NOT NULL
        );
        ",
    ),
];

/// Apply every migration newer than the recorded schema version.
pub(crate) fn apply_pending(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;

        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );
        ",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, super::ts(chrono::Utc::now())],
        )?;
        tx.commit()?;
        tracing::debug!(version, "applied migration");
    }

    Ok(())
}
