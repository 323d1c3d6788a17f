use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an in-memory database wrapped in a handle (tests and dry runs).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(EngineDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, the CLI,
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of a guarded status change.
#[derive(Debug)]
pub enum Transition {
    Applied(Execution),
    Rejected { from: ExecutionStatus },
    NotFound,
}

pub struct EngineDb {
    conn: Connection,
}

const EXECUTION_COLUMNS: &str = "id, status, phase, agent_type, session_id, working_dir, \
     conflict_details, workspace_preserved, error, created_at, completed_at, last_heartbeat";

const PREVIEW_COLUMNS: &str =
    "id, ref_id, execution_id, port, url, status, pid, error, created_at, updated_at";

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'starting',
                    phase TEXT,
                    agent_type TEXT NOT NULL,
                    session_id TEXT,
                    working_dir TEXT,
                    conflict_details TEXT,
                    workspace_preserved INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    last_heartbeat TEXT
                );

                CREATE TABLE IF NOT EXISTS execution_refs (
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    ref_id TEXT NOT NULL,
                    permission TEXT NOT NULL,
                    branch_name TEXT NOT NULL,
                    working_dir TEXT NOT NULL,
                    created_ref INTEGER NOT NULL DEFAULT 0,
                    branch_state TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (execution_id, ref_id)
                );

                CREATE TABLE IF NOT EXISTS ref_changes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    ref_id TEXT NOT NULL,
                    change_type TEXT NOT NULL,
                    branch_name TEXT NOT NULL,
                    commit_hash TEXT,
                    merge_status TEXT,
                    message TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS previews (
                    id TEXT PRIMARY KEY,
                    ref_id TEXT NOT NULL,
                    execution_id TEXT,
                    port INTEGER,
                    url TEXT,
                    status TEXT NOT NULL DEFAULT 'starting',
                    pid INTEGER,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS port_allocations (
                    port INTEGER PRIMARY KEY,
                    preview_id TEXT NOT NULL,
                    allocated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS execution_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL,
                    stream TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cleanup_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    workspace_removed INTEGER NOT NULL DEFAULT 0,
                    branches_removed INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
                CREATE INDEX IF NOT EXISTS idx_ref_changes_execution ON ref_changes(execution_id);
                CREATE INDEX IF NOT EXISTS idx_execution_logs_execution ON execution_logs(execution_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_cleanup_records_execution ON cleanup_records(execution_id);
                CREATE INDEX IF NOT EXISTS idx_previews_execution ON previews(execution_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Executions ────────────────────────────────────────────────────

    pub fn create_execution(
        &self,
        id: &str,
        agent_type: &str,
        session_id: Option<&str>,
    ) -> Result<Execution> {
        self.conn
            .execute(
                "INSERT INTO executions (id, status, agent_type, session_id, created_at, last_heartbeat)
                 VALUES (?1, 'starting', ?2, ?3, ?4, ?4)",
                params![id, agent_type, session_id, now_timestamp()],
            )
            .context("Failed to insert execution")?;
        self.get_execution(id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                ExecutionRow::from_row,
            )
            .optional()
            .context("Failed to query execution")?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    pub fn list_executions(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM executions ORDER BY created_at",
                EXECUTION_COLUMNS
            ))
            .context("Failed to prepare list_executions")?;
        let rows = stmt
            .query_map([], ExecutionRow::from_row)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            let execution = row.context("Failed to read execution row")?.into_execution()?;
            if statuses.is_empty() || statuses.contains(&execution.status) {
                executions.push(execution);
            }
        }
        Ok(executions)
    }

    pub fn count_active_executions(&self) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM executions WHERE status IN ('starting', 'running')",
                [],
                |row| row.get(0),
            )
            .context("Failed to count active executions")
    }

    /// Change status if the lifecycle allows it. The check and the write
    /// happen under the same connection lock.
    pub fn transition_execution(
        &self,
        id: &str,
        to: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<Transition> {
        let Some(current) = self.get_execution(id)? else {
            return Ok(Transition::NotFound);
        };
        if !current.status.can_transition_to(to) {
            return Ok(Transition::Rejected {
                from: current.status,
            });
        }
        let now = now_timestamp();
        self.conn
            .execute(
                "UPDATE executions
                 SET status = ?1,
                     error = COALESCE(?2, error),
                     completed_at = CASE WHEN ?3 THEN COALESCE(completed_at, ?4) ELSE completed_at END,
                     last_heartbeat = ?4
                 WHERE id = ?5",
                params![to.as_str(), error, to.is_terminal(), now, id],
            )
            .context("Failed to update execution status")?;
        let updated = self
            .get_execution(id)?
            .context("Execution vanished during status update")?;
        Ok(Transition::Applied(updated))
    }

    pub fn set_execution_phase(&self, id: &str, phase: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE executions SET phase = ?1, last_heartbeat = ?2 WHERE id = ?3",
                params![phase, now_timestamp(), id],
            )
            .context("Failed to update execution phase")?;
        Ok(n > 0)
    }

    pub fn set_session_id(&self, id: &str, session_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE executions SET session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to update session id")?;
        Ok(n > 0)
    }

    pub fn set_working_dir(&self, id: &str, working_dir: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET working_dir = ?1 WHERE id = ?2",
                params![working_dir, id],
            )
            .context("Failed to update working dir")?;
        Ok(())
    }

    pub fn touch_heartbeat(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE executions SET last_heartbeat = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )
            .context("Failed to update heartbeat")?;
        Ok(n > 0)
    }

    pub fn set_conflict_details(&self, id: &str, details: Option<&ConflictDetails>) -> Result<()> {
        let json = details
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize conflict details")?;
        self.conn
            .execute(
                "UPDATE executions SET conflict_details = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update conflict details")?;
        Ok(())
    }

    pub fn set_workspace_preserved(&self, id: &str, preserved: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET workspace_preserved = ?1 WHERE id = ?2",
                params![preserved, id],
            )
            .context("Failed to update workspace_preserved")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_completed_at(&self, id: &str, completed_at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE executions SET completed_at = ?1, last_heartbeat = ?1 WHERE id = ?2",
            params![completed_at, id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // ── Manifest ──────────────────────────────────────────────────────

    pub fn insert_manifest_entry(&self, execution_id: &str, entry: &ManifestEntry) -> Result<()> {
        let working_dir = entry
            .working_dir
            .to_str()
            .context("Working directory contains invalid UTF-8")?;
        self.conn
            .execute(
                "INSERT INTO execution_refs
                    (execution_id, ref_id, permission, branch_name, working_dir, created_ref, branch_state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    execution_id,
                    entry.ref_id,
                    entry.permission.as_str(),
                    entry.branch_name,
                    working_dir,
                    entry.created_ref,
                    entry.branch_state.as_str(),
                    now_timestamp(),
                ],
            )
            .context("Failed to insert manifest entry")?;
        Ok(())
    }

    pub fn get_manifest_entries(&self, execution_id: &str) -> Result<Vec<ManifestEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ref_id, permission, branch_name, working_dir, created_ref, branch_state
                 FROM execution_refs WHERE execution_id = ?1 ORDER BY ref_id",
            )
            .context("Failed to prepare get_manifest_entries")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query manifest entries")?;
        let mut entries = Vec::new();
        for row in rows {
            let (ref_id, permission, branch_name, working_dir, created_ref, branch_state) =
                row.context("Failed to read manifest row")?;
            entries.push(ManifestEntry {
                ref_id,
                permission: RefPermission::from_str(&permission).map_err(|e| anyhow::anyhow!(e))?,
                branch_name,
                working_dir: working_dir.into(),
                created_ref,
                branch_state: BranchState::from_str(&branch_state)
                    .map_err(|e| anyhow::anyhow!(e))?,
            });
        }
        Ok(entries)
    }

    pub fn update_manifest_permission(
        &self,
        execution_id: &str,
        ref_id: &str,
        permission: RefPermission,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE execution_refs SET permission = ?1 WHERE execution_id = ?2 AND ref_id = ?3",
                params![permission.as_str(), execution_id, ref_id],
            )
            .context("Failed to update manifest permission")?;
        Ok(())
    }

    pub fn delete_manifest_entry(&self, execution_id: &str, ref_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM execution_refs WHERE execution_id = ?1 AND ref_id = ?2",
                params![execution_id, ref_id],
            )
            .context("Failed to delete manifest entry")?;
        Ok(())
    }

    /// Flip every branch of an execution in a single statement.
    pub fn set_branch_state(&self, execution_id: &str, state: BranchState) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE execution_refs SET branch_state = ?1 WHERE execution_id = ?2",
                params![state.as_str(), execution_id],
            )
            .context("Failed to update branch state")
    }

    // ── Ref change records ────────────────────────────────────────────

    /// Append change records in one transaction: either every row lands or none.
    pub fn insert_change_records(&self, records: &[NewChangeRecord]) -> Result<Vec<i64>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin change record transaction")?;
        let now = now_timestamp();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            tx.execute(
                "INSERT INTO ref_changes
                    (execution_id, ref_id, change_type, branch_name, commit_hash, merge_status, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.execution_id,
                    record.ref_id,
                    record.change_type.as_str(),
                    record.branch_name,
                    record.commit_hash,
                    record.merge_status,
                    record.message,
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to insert {} record for ref {}",
                    record.change_type.as_str(),
                    record.ref_id
                )
            })?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit().context("Failed to commit change records")?;
        Ok(ids)
    }

    pub fn list_change_records(&self, execution_id: &str) -> Result<Vec<RefChangeRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, execution_id, ref_id, change_type, branch_name, commit_hash, merge_status, message, created_at
                 FROM ref_changes WHERE execution_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_change_records")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .context("Failed to query change records")?;
        let mut records = Vec::new();
        for row in rows {
            let (id, execution_id, ref_id, change_type, branch_name, commit_hash, merge_status, message, created_at) =
                row.context("Failed to read change record row")?;
            records.push(RefChangeRecord {
                id,
                execution_id,
                ref_id,
                change_type: ChangeType::from_str(&change_type).map_err(|e| anyhow::anyhow!(e))?,
                branch_name,
                commit_hash,
                merge_status,
                message,
                created_at,
            });
        }
        Ok(records)
    }

    // ── Logs ──────────────────────────────────────────────────────────

    pub fn insert_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin log transaction")?;
        for entry in entries {
            tx.execute(
                "INSERT INTO execution_logs (execution_id, stream, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.execution_id,
                    entry.stream.as_str(),
                    entry.content,
                    entry.timestamp
                ],
            )
            .context("Failed to insert log entry")?;
        }
        tx.commit().context("Failed to commit log entries")?;
        Ok(())
    }

    /// Log entries of an execution in persistence order. `limit` keeps the
    /// most recent entries.
    pub fn list_log_entries(&self, execution_id: &str, limit: Option<u32>) -> Result<Vec<LogEntry>> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT execution_id, stream, content, timestamp FROM (
                    SELECT id, execution_id, stream, content, timestamp FROM execution_logs
                    WHERE execution_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2
                 ) ORDER BY timestamp ASC, id ASC",
            )
            .context("Failed to prepare list_log_entries")?;
        let rows = stmt
            .query_map(params![execution_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query log entries")?;
        let mut entries = Vec::new();
        for row in rows {
            let (execution_id, stream, content, timestamp) =
                row.context("Failed to read log row")?;
            entries.push(LogEntry {
                execution_id,
                stream: LogStream::from_str(&stream).map_err(|e| anyhow::anyhow!(e))?,
                content,
                timestamp,
            });
        }
        Ok(entries)
    }

    // ── Port allocations ──────────────────────────────────────────────

    /// Reserve a port. Returns `false` when the port is already recorded.
    pub fn insert_port_allocation(&self, port: u16, preview_id: &str) -> Result<bool> {
        match self.conn.execute(
            "INSERT INTO port_allocations (port, preview_id, allocated_at) VALUES (?1, ?2, ?3)",
            params![port, preview_id, now_timestamp()],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(anyhow::anyhow!("Failed to insert port allocation: {}", e)),
        }
    }

    pub fn is_port_allocated(&self, port: u16) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM port_allocations WHERE port = ?1",
                params![port],
                |row| row.get(0),
            )
            .context("Failed to query port allocation")?;
        Ok(count > 0)
    }

    pub fn delete_port_allocation(&self, port: u16) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM port_allocations WHERE port = ?1", params![port])
            .context("Failed to delete port allocation")?;
        Ok(n > 0)
    }

    pub fn delete_port_allocations_for_preview(&self, preview_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM port_allocations WHERE preview_id = ?1",
                params![preview_id],
            )
            .context("Failed to delete port allocations for preview")
    }

    pub fn list_port_allocations(&self) -> Result<Vec<PortAllocation>> {
        let mut stmt = self
            .conn
            .prepare("SELECT port, preview_id, allocated_at FROM port_allocations ORDER BY port")
            .context("Failed to prepare list_port_allocations")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PortAllocation {
                    port: row.get(0)?,
                    preview_id: row.get(1)?,
                    allocated_at: row.get(2)?,
                })
            })
            .context("Failed to query port allocations")?;
        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(row.context("Failed to read port allocation row")?);
        }
        Ok(allocations)
    }

    /// Allocations whose preview is missing or stopped/failed.
    pub fn list_stale_port_allocations(&self) -> Result<Vec<PortAllocation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.port, a.preview_id, a.allocated_at FROM port_allocations a
                 LEFT JOIN previews p ON p.id = a.preview_id
                 WHERE p.id IS NULL OR p.status IN ('stopped', 'failed')
                 ORDER BY a.port",
            )
            .context("Failed to prepare list_stale_port_allocations")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PortAllocation {
                    port: row.get(0)?,
                    preview_id: row.get(1)?,
                    allocated_at: row.get(2)?,
                })
            })
            .context("Failed to query stale port allocations")?;
        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(row.context("Failed to read port allocation row")?);
        }
        Ok(allocations)
    }

    // ── Previews ──────────────────────────────────────────────────────

    pub fn create_preview(
        &self,
        id: &str,
        ref_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Preview> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO previews (id, ref_id, execution_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'starting', ?4, ?4)",
                params![id, ref_id, execution_id, now],
            )
            .context("Failed to insert preview")?;
        self.get_preview(id)?.context("Preview not found after insert")
    }

    pub fn get_preview(&self, id: &str) -> Result<Option<Preview>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM previews WHERE id = ?1", PREVIEW_COLUMNS),
                params![id],
                PreviewRow::from_row,
            )
            .optional()
            .context("Failed to query preview")?;
        row.map(PreviewRow::into_preview).transpose()
    }

    pub fn update_preview(
        &self,
        id: &str,
        status: PreviewStatus,
        port: Option<u16>,
        url: Option<&str>,
        pid: Option<u32>,
        error: Option<&str>,
    ) -> Result<Preview> {
        self.conn
            .execute(
                "UPDATE previews SET status = ?1,
                    port = COALESCE(?2, port),
                    url = COALESCE(?3, url),
                    pid = COALESCE(?4, pid),
                    error = COALESCE(?5, error),
                    updated_at = ?6
                 WHERE id = ?7",
                params![status.as_str(), port, url, pid, error, now_timestamp(), id],
            )
            .context("Failed to update preview")?;
        self.get_preview(id)?.context("Preview not found after update")
    }

    pub fn count_live_previews_for_execution(&self, execution_id: &str) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM previews
                 WHERE execution_id = ?1 AND status IN ('starting', 'running')",
                params![execution_id],
                |row| row.get(0),
            )
            .context("Failed to count live previews")
    }

    // ── Cleanup records ───────────────────────────────────────────────

    pub fn insert_cleanup_record(&self, record: &CleanupRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cleanup_records
                    (execution_id, action, success, workspace_removed, branches_removed, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.execution_id,
                    record.action.as_str(),
                    record.success,
                    record.workspace_removed,
                    record.branches_removed,
                    record.error,
                    record.created_at,
                ],
            )
            .context("Failed to insert cleanup record")?;
        Ok(())
    }

    pub fn latest_cleanup_record(&self, execution_id: &str) -> Result<Option<CleanupRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT execution_id, action, success, workspace_removed, branches_removed, error, created_at
                 FROM cleanup_records WHERE execution_id = ?1 ORDER BY id DESC LIMIT 1",
                params![execution_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query cleanup record")?;
        row.map(
            |(execution_id, action, success, workspace_removed, branches_removed, error, created_at)| {
                Ok(CleanupRecord {
                    execution_id,
                    action: CleanupAction::from_str(&action).map_err(|e| anyhow::anyhow!(e))?,
                    success,
                    workspace_removed,
                    branches_removed,
                    error,
                    created_at,
                })
            },
        )
        .transpose()
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

/// Intermediate row struct for executions.
struct ExecutionRow {
    id: String,
    status: String,
    phase: Option<String>,
    agent_type: String,
    session_id: Option<String>,
    working_dir: Option<String>,
    conflict_details: Option<String>,
    workspace_preserved: bool,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    last_heartbeat: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            phase: row.get(2)?,
            agent_type: row.get(3)?,
            session_id: row.get(4)?,
            working_dir: row.get(5)?,
            conflict_details: row.get(6)?,
            workspace_preserved: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            completed_at: row.get(10)?,
            last_heartbeat: row.get(11)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let status = ExecutionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution status")?;
        let conflict_details = self
            .conflict_details
            .as_deref()
            .map(serde_json::from_str::<ConflictDetails>)
            .transpose()
            .context("Failed to parse conflict details JSON")?;
        Ok(Execution {
            id: self.id,
            status,
            phase: self.phase,
            agent_type: self.agent_type,
            session_id: self.session_id,
            working_dir: self.working_dir,
            conflict_details,
            workspace_preserved: self.workspace_preserved,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
            last_heartbeat: self.last_heartbeat,
        })
    }
}

/// Intermediate row struct for previews.
struct PreviewRow {
    id: String,
    ref_id: String,
    execution_id: Option<String>,
    port: Option<u16>,
    url: Option<String>,
    status: String,
    pid: Option<u32>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PreviewRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ref_id: row.get(1)?,
            execution_id: row.get(2)?,
            port: row.get(3)?,
            url: row.get(4)?,
            status: row.get(5)?,
            pid: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_preview(self) -> Result<Preview> {
        let status = PreviewStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse preview status")?;
        Ok(Preview {
            id: self.id,
            ref_id: self.ref_id,
            execution_id: self.execution_id,
            port: self.port,
            url: self.url,
            status,
            pid: self.pid,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
