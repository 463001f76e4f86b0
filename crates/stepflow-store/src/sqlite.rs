use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::execution::{ExecutionRecord, LogEntry};
use stepflow_core::traits::WorkflowStore;
use stepflow_core::types::{ExecutionId, ExecutionStatus, NodeStatus, StepId, WorkflowId};
use stepflow_core::workflow::{
    validate, SnapshotId, VersionInfo, WorkflowGraph, WorkflowSnapshot, WorkflowStats,
    WorkflowSummary,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        snapshot_json TEXT NOT NULL,
        saved_at TEXT NOT NULL,
        UNIQUE(workflow_id, version)
    );

    CREATE TABLE IF NOT EXISTS retired (
        workflow_id TEXT PRIMARY KEY,
        retired_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS drafts (
        workflow_id TEXT PRIMARY KEY,
        graph_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_version INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL,
        node_statuses_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_workflow
        ON executions(workflow_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS execution_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        entry_json TEXT NOT NULL,
        UNIQUE(execution_id, seq)
    );";

/// SQLite-backed workflow store.
///
/// Snapshots and log rows are insert-only. Drafts and the retired marker are
/// the mutable tables. An execution row can be updated until its status is
/// terminal.
pub struct SqliteWorkflowStore {
    conn: Mutex<Connection>,
}

impl SqliteWorkflowStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Workflow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

fn db_err(e: impl std::fmt::Display) -> StepflowError {
    StepflowError::Database(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn stored_status(conn: &Connection, execution_id: &ExecutionId) -> Result<Option<ExecutionStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM executions WHERE execution_id = ?1",
            params![execution_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    status
        .map(|s| s.parse().map_err(StepflowError::Database))
        .transpose()
}

fn log_len(conn: &Connection, execution_id: &ExecutionId) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM execution_log WHERE execution_id = ?1",
            params![execution_id.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(count as usize)
}

fn insert_log(conn: &Connection, execution_id: &ExecutionId, seq: usize, entry: &LogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO execution_log (execution_id, seq, entry_json) VALUES (?1, ?2, ?3)",
        params![execution_id.as_str(), seq as i64, serde_json::to_string(entry)?],
    )
    .map_err(db_err)?;
    Ok(())
}

struct ExecutionRow {
    execution_id: String,
    workflow_id: String,
    workflow_version: i64,
    started_at: String,
    completed_at: Option<String>,
    status: String,
    node_statuses_json: String,
}

const EXECUTION_COLUMNS: &str = "execution_id, workflow_id, workflow_version, started_at, \
                                 completed_at, status, node_statuses_json";

fn execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        execution_id: row.get(0)?,
        workflow_id: row.get(1)?,
        workflow_version: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        status: row.get(5)?,
        node_statuses_json: row.get(6)?,
    })
}

fn assemble(conn: &Connection, row: ExecutionRow) -> Result<ExecutionRecord> {
    let execution_id = ExecutionId::from(row.execution_id);
    let node_statuses: BTreeMap<StepId, NodeStatus> =
        serde_json::from_str(&row.node_statuses_json)?;

    let mut stmt = conn
        .prepare("SELECT entry_json FROM execution_log WHERE execution_id = ?1 ORDER BY seq")
        .map_err(db_err)?;
    let entries = stmt
        .query_map(params![execution_id.as_str()], |r| r.get::<_, String>(0))
        .map_err(db_err)?;
    let mut log = Vec::new();
    for entry in entries {
        log.push(serde_json::from_str(&entry.map_err(db_err)?)?);
    }

    Ok(ExecutionRecord {
        execution_id,
        workflow_id: WorkflowId::from(row.workflow_id),
        workflow_version: row.workflow_version as u32,
        started_at: parse_ts(&row.started_at),
        completed_at: row.completed_at.as_deref().map(parse_ts),
        status: row.status.parse().map_err(StepflowError::Database)?,
        node_statuses,
        log,
    })
}

impl WorkflowStore for SqliteWorkflowStore {
    fn save(&self, graph: &WorkflowGraph) -> Result<SnapshotId> {
        let report = validate(graph);
        if !report.is_valid {
            return Err(StepflowError::Validation(report.errors));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let latest: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM snapshots WHERE workflow_id = ?1",
                params![graph.id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let snapshot = WorkflowSnapshot::new(graph.clone(), latest as u32 + 1);

        tx.execute(
            "INSERT INTO snapshots (workflow_id, version, name, snapshot_json, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                graph.id.as_str(),
                snapshot.version as i64,
                graph.metadata.name,
                serde_json::to_string(&snapshot)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM retired WHERE workflow_id = ?1",
            params![graph.id.as_str()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        let id = snapshot.id();
        debug!(snapshot = %id, "Workflow snapshot saved");
        Ok(id)
    }

    fn load_latest(&self, workflow_id: &WorkflowId) -> Result<WorkflowSnapshot> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE workflow_id = ?1
                 AND workflow_id NOT IN (SELECT workflow_id FROM retired)
                 ORDER BY version DESC LIMIT 1",
                params![workflow_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StepflowError::WorkflowNotFound(workflow_id.to_string())),
        }
    }

    fn load_version(&self, workflow_id: &WorkflowId, version: u32) -> Result<WorkflowSnapshot> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE workflow_id = ?1 AND version = ?2",
                params![workflow_id.as_str(), version as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StepflowError::WorkflowNotFound(format!(
                "{}@v{}",
                workflow_id, version
            ))),
        }
    }

    fn list_versions(&self, workflow_id: &WorkflowId) -> Result<Vec<VersionInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT version, name, saved_at FROM snapshots
                 WHERE workflow_id = ?1 ORDER BY version",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workflow_id.as_str()], |row| {
                let saved_at: String = row.get(2)?;
                Ok(VersionInfo {
                    version: row.get::<_, i64>(0)? as u32,
                    name: row.get(1)?,
                    saved_at: parse_ts(&saved_at),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.workflow_id, s.name, s.version, s.saved_at FROM snapshots s
                 WHERE s.version = (
                     SELECT MAX(version) FROM snapshots WHERE workflow_id = s.workflow_id
                 )
                 AND s.workflow_id NOT IN (SELECT workflow_id FROM retired)
                 ORDER BY s.name, s.workflow_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let saved_at: String = row.get(3)?;
                Ok(WorkflowSummary {
                    workflow_id: WorkflowId::from(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    latest_version: row.get::<_, i64>(2)? as u32,
                    saved_at: parse_ts(&saved_at),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let saved: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE workflow_id = ?1",
                params![workflow_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if saved == 0 {
            return Err(StepflowError::WorkflowNotFound(workflow_id.to_string()));
        }

        let retired = tx
            .execute(
                "INSERT OR IGNORE INTO retired (workflow_id, retired_at) VALUES (?1, ?2)",
                params![workflow_id.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM drafts WHERE workflow_id = ?1",
            params![workflow_id.as_str()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        debug!(workflow_id = %workflow_id, "Workflow retired");
        Ok(retired > 0)
    }

    fn save_draft(&self, graph: &WorkflowGraph) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO drafts (workflow_id, graph_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(workflow_id) DO UPDATE SET
                 graph_json = excluded.graph_json,
                 updated_at = excluded.updated_at",
            params![
                graph.id.as_str(),
                serde_json::to_string(graph)?,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_draft(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowGraph>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT graph_json FROM drafts WHERE workflow_id = ?1",
                params![workflow_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(StepflowError::from))
            .transpose()
    }

    fn delete_draft(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM drafts WHERE workflow_id = ?1",
                params![workflow_id.as_str()],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        if stored_status(&tx, &record.execution_id)?.is_some_and(|s| s.is_terminal()) {
            return Err(StepflowError::RecordSealed(record.execution_id.to_string()));
        }

        tx.execute(
            "INSERT INTO executions
                 (execution_id, workflow_id, workflow_version, started_at, completed_at, status, node_statuses_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(execution_id) DO UPDATE SET
                 completed_at = excluded.completed_at,
                 status = excluded.status,
                 node_statuses_json = excluded.node_statuses_json",
            params![
                record.execution_id.as_str(),
                record.workflow_id.as_str(),
                record.workflow_version as i64,
                record.started_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.status.to_string(),
                serde_json::to_string(&record.node_statuses)?,
            ],
        )
        .map_err(db_err)?;

        // the stored log is always a prefix of the record's log
        let stored = log_len(&tx, &record.execution_id)?;
        for (seq, entry) in record.log.iter().enumerate().skip(stored) {
            insert_log(&tx, &record.execution_id, seq, entry)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn append_log(&self, execution_id: &ExecutionId, entry: &LogEntry) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        match stored_status(&tx, execution_id)? {
            None => return Err(StepflowError::ExecutionNotFound(execution_id.to_string())),
            Some(status) if status.is_terminal() => {
                return Err(StepflowError::RecordSealed(execution_id.to_string()))
            }
            Some(_) => {}
        }
        let seq = log_len(&tx, execution_id)?;
        insert_log(&tx, execution_id, seq, entry)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_execution(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions WHERE execution_id = ?1",
                    EXECUTION_COLUMNS
                ),
                params![execution_id.as_str()],
                execution_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StepflowError::ExecutionNotFound(execution_id.to_string()))?;
        assemble(&conn, row)
    }

    fn list_executions(&self, workflow_id: &WorkflowId) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock()?;
        let rows = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY started_at DESC",
                    EXECUTION_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![workflow_id.as_str()], execution_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        rows.into_iter().map(|row| assemble(&conn, row)).collect()
    }

    fn workflow_stats(&self, workflow_id: &WorkflowId) -> Result<WorkflowStats> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, started_at, completed_at FROM executions WHERE workflow_id = ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workflow_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut stats = WorkflowStats::new(workflow_id.clone());
        let mut finished_ms: Vec<i64> = Vec::new();
        for row in rows {
            let (status, started_at, completed_at) = row.map_err(db_err)?;
            let started_at = parse_ts(&started_at);
            stats.total += 1;
            match status.parse::<ExecutionStatus>().map_err(StepflowError::Database)? {
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Suspended => stats.suspended += 1,
                ExecutionStatus::Success => stats.succeeded += 1,
                ExecutionStatus::Failed => stats.failed += 1,
            }
            if let Some(completed_at) = completed_at.as_deref().map(parse_ts) {
                finished_ms.push((completed_at - started_at).num_milliseconds().max(0));
            }
            if stats.last_started_at.map_or(true, |last| started_at > last) {
                stats.last_started_at = Some(started_at);
            }
        }
        if !finished_ms.is_empty() {
            let sum: i64 = finished_ms.iter().sum();
            stats.mean_duration_ms = Some((sum / finished_ms.len() as i64) as u64);
        }
        Ok(stats)
    }
}
