//! SQLite-based persistence for production use.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{SchedError, SchedResult};
use crate::persistence::{RunStore, WorkspaceRegistry};
use crate::run::{RunFilter, RunId, RunRecord, RunState};

/// SQLite-based store for runs and workspaces.
///
/// Several processes may share one database file: the CLI cancels runs
/// driven by another process through the `cancel_requested` column, and
/// the driving process keeps `heartbeat_ms` fresh so that runs it abandons
/// can be claimed by another.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Create a new in-memory SQLite store.
    pub fn in_memory() -> SchedResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    fn lock(&self) -> SchedResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchedError::DatabaseError(e.to_string()))
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                state TEXT NOT NULL,
                data TEXT NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                heartbeat_ms INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            CREATE INDEX IF NOT EXISTS idx_runs_workspace ON runs(workspace_id);
            CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);

            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                status TEXT,
                last_run_id TEXT,
                result_path TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        // Databases created before heartbeats were tracked.
        if conn.prepare("SELECT heartbeat_ms FROM runs LIMIT 0").is_err() {
            conn.execute("ALTER TABLE runs ADD COLUMN heartbeat_ms INTEGER", [])?;
        }
        Ok(())
    }

    /// Register (or move) a workspace.
    pub async fn register_workspace(
        &self,
        workspace_id: &str,
        path: impl AsRef<Path>,
    ) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO workspaces (id, path, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET path = excluded.path, updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                workspace_id,
                path.as_ref().to_string_lossy(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Status and result pointer last written for a workspace.
    pub async fn workspace_outcome(
        &self,
        workspace_id: &str,
    ) -> SchedResult<Option<(Option<String>, Option<PathBuf>)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT status, result_path FROM workspaces WHERE id = ?1",
                rusqlite::params![workspace_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?.map(PathBuf::from),
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }
}

const RUN_COLUMNS: &str = "data, cancel_requested, heartbeat_ms";

fn run_from_row(row: &Row<'_>) -> SchedResult<RunRecord> {
    let data: String = row.get(0)?;
    let mut run: RunRecord = serde_json::from_str(&data)?;
    run.cancel_requested = row.get::<_, i64>(1)? != 0;
    run.heartbeat_at = row
        .get::<_, Option<i64>>(2)?
        .and_then(DateTime::from_timestamp_millis);
    Ok(run)
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn save_run(&self, run: &RunRecord) -> SchedResult<()> {
        let conn = self.lock()?;
        let data = serde_json::to_string(run)?;

        conn.execute(
            r#"
            INSERT INTO runs (id, workflow_id, workspace_id, state, data, heartbeat_ms,
                              created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                data = excluded.data,
                heartbeat_ms = excluded.heartbeat_ms,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                run.id.to_string(),
                run.request.workflow_id,
                run.request.workspace_id,
                run.state.name(),
                data,
                run.heartbeat_at.map(|at| at.timestamp_millis()),
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> SchedResult<Option<RunRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
        let mut rows = stmt.query(rusqlite::params![run_id.to_string()])?;

        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<RunRecord>> {
        let conn = self.lock()?;

        // Build query based on filter
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref states) = filter.states {
            let placeholders: Vec<_> = states
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", params.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(", ")));
            for state in states {
                params.push(Box::new(state.name()));
            }
        }

        if let Some(ref workspace_id) = filter.workspace_id {
            let idx = params.len() + 1;
            sql.push_str(&format!(" AND workspace_id = ?{}", idx));
            params.push(Box::new(workspace_id.clone()));
        }

        sql.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            let idx = params.len() + 1;
            sql.push_str(&format!(" LIMIT ?{}", idx));
            params.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;

        // Convert params to references for query
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(params_refs.as_slice())?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(run_from_row(row)?);
        }

        Ok(runs)
    }

    async fn request_cancel(&self, run_id: &RunId) -> SchedResult<bool> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM runs WHERE id = ?1",
                rusqlite::params![run_id.to_string()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(SchedError::RunNotFound(run_id.to_string()));
        }

        let updated = conn.execute(
            "UPDATE runs SET cancel_requested = 1 WHERE id = ?1 AND cancel_requested = 0",
            rusqlite::params![run_id.to_string()],
        )?;
        Ok(updated > 0)
    }

    async fn is_cancel_requested(&self, run_id: &RunId) -> SchedResult<bool> {
        let conn = self.lock()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM runs WHERE id = ?1",
                rusqlite::params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.is_some_and(|f| f != 0))
    }

    async fn touch_run(&self, run_id: &RunId, at: DateTime<Utc>) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET heartbeat_ms = ?2 WHERE id = ?1",
            rusqlite::params![run_id.to_string(), at.timestamp_millis()],
        )?;
        Ok(())
    }

    async fn claim_run(&self, run_id: &RunId, stale_before: DateTime<Utc>) -> SchedResult<bool> {
        let conn = self.lock()?;
        let claimed = conn.execute(
            r#"
            UPDATE runs SET heartbeat_ms = ?2
            WHERE id = ?1
              AND state NOT IN ('DONE', 'FAILED', 'CANCELLED')
              AND (heartbeat_ms IS NULL OR heartbeat_ms < ?3)
            "#,
            rusqlite::params![
                run_id.to_string(),
                Utc::now().timestamp_millis(),
                stale_before.timestamp_millis(),
            ],
        )?;
        Ok(claimed > 0)
    }

    async fn delete_run(&self, run_id: &RunId) -> SchedResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM runs WHERE id = ?1",
            rusqlite::params![run_id.to_string()],
        )?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl WorkspaceRegistry for SqliteStore {
    async fn workspace_path(&self, workspace_id: &str) -> SchedResult<PathBuf> {
        let conn = self.lock()?;
        let path: Option<String> = conn
            .query_row(
                "SELECT path FROM workspaces WHERE id = ?1",
                rusqlite::params![workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        path.map(PathBuf::from)
            .ok_or_else(|| SchedError::WorkspaceNotFound(workspace_id.to_string()))
    }

    async fn record_outcome(
        &self,
        workspace_id: &str,
        run_id: &RunId,
        state: RunState,
        output: Option<&Path>,
    ) -> SchedResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"
            UPDATE workspaces
            SET status = ?2, last_run_id = ?3, result_path = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            rusqlite::params![
                workspace_id,
                state.name(),
                run_id.to_string(),
                output.map(|p| p.to_string_lossy().into_owned()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(SchedError::WorkspaceNotFound(workspace_id.to_string()));
        }
        Ok(())
    }
}
