use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;
use crate::audit::{AuditEntry, NewAuditEntry, SubjectKind};
use crate::errors::SliceError;
use crate::util::branch_name_for_slice;

/// Async-safe handle to the engine database.
///
/// Wraps `SliceDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SliceDb>>,
}

impl DbHandle {
    pub fn new(db: SliceDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SliceDb) -> Result<R> + Send + 'static,
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

    /// Acquire the database mutex synchronously. For start-up, CLI commands
    /// and tests only; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SliceDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A state change, the Run that caused it and its audit entry, written in
/// one transaction.
#[derive(Debug, Clone)]
pub struct TransitionWrite {
    pub slice_id: i64,
    pub expected_state: SliceState,
    pub expected_version: i64,
    pub next_state: SliceState,
    pub failed_step: Option<Step>,
    pub run: Option<(i64, RunFinal)>,
    pub audit: NewAuditEntry,
}

pub struct SliceDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(|e| anyhow::anyhow!(e))
}

impl SliceDb {
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
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    github_repo TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS members (
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'member',
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS slices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    scope TEXT NOT NULL DEFAULT '',
                    out_of_scope TEXT NOT NULL DEFAULT '',
                    risk_level TEXT NOT NULL DEFAULT 'medium',
                    acceptance TEXT NOT NULL DEFAULT '[]',
                    branch_name TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'draft',
                    failed_step TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    pr_number INTEGER,
                    pr_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (project_id, branch_name)
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slice_id INTEGER NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    output TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    commit_sha TEXT,
                    parked INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS run_artifacts (
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    sha256 TEXT NOT NULL,
                    PRIMARY KEY (run_id, path)
                );

                CREATE TABLE IF NOT EXISTS gate_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    passed INTEGER NOT NULL,
                    failure TEXT,
                    exit_code INTEGER,
                    stdout TEXT NOT NULL DEFAULT '',
                    stderr TEXT NOT NULL DEFAULT '',
                    duration_ms INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS audit_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entry_id TEXT NOT NULL UNIQUE,
                    timestamp TEXT NOT NULL,
                    actor_kind TEXT NOT NULL,
                    actor_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    subject_kind TEXT NOT NULL,
                    subject_id INTEGER NOT NULL,
                    payload TEXT NOT NULL DEFAULT 'null'
                );

                CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
                BEFORE UPDATE ON audit_entries
                BEGIN
                    SELECT RAISE(ABORT, 'audit entries are append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
                BEFORE DELETE ON audit_entries
                BEGIN
                    SELECT RAISE(ABORT, 'audit entries are append-only');
                END;

                CREATE TABLE IF NOT EXISTS user_llm_configs (
                    user_id TEXT PRIMARY KEY,
                    settings TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS project_llm_configs (
                    project_id INTEGER PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
                    settings TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS slice_quadrants (
                    slice_id INTEGER PRIMARY KEY REFERENCES slices(id) ON DELETE CASCADE,
                    functional_core TEXT NOT NULL DEFAULT '',
                    physical_constraints TEXT NOT NULL DEFAULT '',
                    semantic_contract TEXT NOT NULL DEFAULT '',
                    exceptions TEXT NOT NULL DEFAULT '',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS trace_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slice_id INTEGER NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
                    code TEXT NOT NULL,
                    category TEXT NOT NULL,
                    text TEXT NOT NULL,
                    target_files TEXT NOT NULL DEFAULT '[]',
                    commit_sha TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    notes TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (slice_id, code)
                );

                CREATE TABLE IF NOT EXISTS coverage_reports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slice_id INTEGER NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
                    run_id INTEGER REFERENCES runs(id) ON DELETE SET NULL,
                    total INTEGER NOT NULL,
                    passed INTEGER NOT NULL,
                    failed INTEGER NOT NULL,
                    coverage REAL NOT NULL,
                    findings TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS control_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slice_id INTEGER NOT NULL REFERENCES slices(id) ON DELETE CASCADE,
                    layer TEXT NOT NULL,
                    item TEXT NOT NULL,
                    source TEXT NOT NULL,
                    tracking TEXT NOT NULL,
                    acceptance TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    updated_by TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_slices_project ON slices(project_id);
                CREATE INDEX IF NOT EXISTS idx_runs_slice ON runs(slice_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_gate_results_run ON gate_results(run_id);
                CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_entries(subject_kind, subject_id);
                CREATE INDEX IF NOT EXISTS idx_coverage_slice ON coverage_reports(slice_id);
                CREATE INDEX IF NOT EXISTS idx_control_slice ON control_items(slice_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations; only "duplicate column" is ignored.
        match self.conn.execute(
            "ALTER TABLE runs ADD COLUMN parked INTEGER NOT NULL DEFAULT 0",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add parked column: {}", e)),
        }
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        repo_url: &str,
        default_branch: &str,
        github_repo: Option<&str>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, repo_url, default_branch, github_repo, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, repo_url, default_branch, github_repo, now()],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)
    }

    pub fn get_project(&self, id: i64) -> Result<Project> {
        self.conn
            .query_row(
                "SELECT id, name, repo_url, default_branch, github_repo, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        repo_url: row.get(2)?,
                        default_branch: row.get(3)?,
                        github_repo: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")?
            .ok_or_else(|| SliceError::NotFound { kind: "Project", id }.into())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, repo_url, default_branch, github_repo, created_at
             FROM projects ORDER BY id",
        )?;
        let projects = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    repo_url: row.get(2)?,
                    default_branch: row.get(3)?,
                    github_repo: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list projects")?;
        Ok(projects)
    }

    /// Delete a project and its finished slices. Refused while any slice is
    /// still in a non-terminal state.
    pub fn delete_project(&self, id: i64) -> Result<()> {
        self.get_project(id)?;
        let active: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM slices
             WHERE project_id = ?1 AND state NOT IN ('ci_passed', 'abandoned')",
            params![id],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(SliceError::ProjectHasActiveSlices {
                project_id: id,
                count: active,
            }
            .into());
        }
        self.conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(())
    }

    // ── Members ───────────────────────────────────────────────────────

    pub fn upsert_member(&self, project_id: i64, user_id: &str, role: MemberRole) -> Result<Member> {
        self.get_project(project_id)?;
        self.conn
            .execute(
                "INSERT INTO members (project_id, user_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role",
                params![project_id, user_id, role.as_str(), now()],
            )
            .context("Failed to upsert member")?;
        self.list_members(project_id)?
            .into_iter()
            .find(|m| m.user_id == user_id)
            .context("Member vanished after insert")
    }

    pub fn list_members(&self, project_id: i64) -> Result<Vec<Member>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, user_id, role, created_at FROM members
             WHERE project_id = ?1 ORDER BY created_at, user_id",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(project_id, user_id, role, created_at)| {
                Ok(Member {
                    project_id,
                    user_id,
                    role: parse(&role)?,
                    created_at,
                })
            })
            .collect()
    }

    pub fn member_role(&self, project_id: i64, user_id: &str) -> Result<Option<MemberRole>> {
        let role: Option<String> = self
            .conn
            .query_row(
                "SELECT role FROM members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        role.as_deref().map(parse).transpose()
    }

    // ── Slice CRUD ────────────────────────────────────────────────────

    /// Insert a draft slice. The branch name embeds the new id, so it is
    /// assigned inside the same transaction.
    pub fn create_slice(&self, new: &NewSlice) -> Result<Slice> {
        self.get_project(new.project_id)?;
        let acceptance =
            serde_json::to_string(&new.acceptance).context("Failed to encode acceptance")?;
        let tx = self.conn.unchecked_transaction()?;
        let ts = now();
        tx.execute(
            "INSERT INTO slices (project_id, title, scope, out_of_scope, risk_level, acceptance,
                                 branch_name, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'draft', ?8, ?8)",
            params![
                new.project_id,
                new.title,
                new.scope,
                new.out_of_scope,
                new.risk_level.as_str(),
                acceptance,
                format!("pending/{}", Uuid::new_v4()),
                ts,
            ],
        )
        .context("Failed to insert slice")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE slices SET branch_name = ?1 WHERE id = ?2",
            params![branch_name_for_slice(id, &new.title), id],
        )
        .context("Failed to assign slice branch")?;
        tx.commit()?;
        self.get_slice(id)
    }

    const SLICE_COLUMNS: &'static str = "id, project_id, title, scope, out_of_scope, risk_level,
        acceptance, branch_name, state, failed_step, version, pr_number, pr_url, created_at,
        updated_at";

    pub fn get_slice(&self, id: i64) -> Result<Slice> {
        let sql = format!("SELECT {} FROM slices WHERE id = ?1", Self::SLICE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], SliceRow::from_row)
            .optional()
            .context("Failed to query slice")?
            .ok_or(SliceError::NotFound { kind: "Slice", id })?;
        row.into_slice()
    }

    pub fn list_slices(&self, project_id: Option<i64>) -> Result<Vec<Slice>> {
        let sql = format!(
            "SELECT {} FROM slices WHERE (?1 IS NULL OR project_id = ?1) ORDER BY id",
            Self::SLICE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![project_id], SliceRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list slices")?;
        rows.into_iter().map(SliceRow::into_slice).collect()
    }

    pub fn set_slice_pr(&self, slice_id: i64, number: i64, url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE slices SET pr_number = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
                params![number, url, now(), slice_id],
            )
            .context("Failed to store PR reference")?;
        Ok(())
    }

    /// Apply a state change guarded by an optimistic check on the stored
    /// state and version. A mismatch rolls everything back and fails with
    /// `ConcurrentModification`.
    pub fn apply_transition(&self, write: &TransitionWrite) -> Result<Slice> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx
            .execute(
                "UPDATE slices
                 SET state = ?1, failed_step = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND state = ?5 AND version = ?6",
                params![
                    write.next_state.as_str(),
                    write.failed_step.map(|s| s.as_str()),
                    now(),
                    write.slice_id,
                    write.expected_state.as_str(),
                    write.expected_version,
                ],
            )
            .context("Failed to update slice state")?;
        if changed == 0 {
            return Err(SliceError::ConcurrentModification {
                slice_id: write.slice_id,
                expected: write.expected_state.as_str().to_string(),
            }
            .into());
        }
        if let Some((run_id, fin)) = &write.run {
            write_run_final(&tx, *run_id, fin)?;
        }
        insert_audit(&tx, &write.audit)?;
        tx.commit().context("Failed to commit transition")?;
        self.get_slice(write.slice_id)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, slice_id: i64, kind: RunKind) -> Result<Run> {
        self.conn
            .execute(
                "INSERT INTO runs (slice_id, kind, status, started_at) VALUES (?1, ?2, 'running', ?3)",
                params![slice_id, kind.as_str(), now()],
            )
            .context("Failed to insert run")?;
        self.get_run(self.conn.last_insert_rowid())
    }

    const RUN_COLUMNS: &'static str =
        "id, slice_id, kind, status, attempts, output, error, commit_sha, started_at, finished_at, parked";

    pub fn get_run(&self, id: i64) -> Result<Run> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", Self::RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?
            .ok_or(SliceError::NotFound { kind: "Run", id })?;
        let artifacts = self.run_artifacts(id)?;
        row.into_run(artifacts)
    }

    pub fn list_runs(&self, slice_id: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE slice_id = ?1 ORDER BY id",
            Self::RUN_COLUMNS
        );
        self.query_runs(&sql, params![slice_id])
    }

    /// Runs left non-final, e.g. by a process restart.
    pub fn list_unfinished_runs(&self) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE status = 'running' ORDER BY id",
            Self::RUN_COLUMNS
        );
        self.query_runs(&sql, params![])
    }

    fn query_runs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RunRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list runs")?;
        rows.into_iter()
            .map(|row| {
                let artifacts = self.run_artifacts(row.id)?;
                row.into_run(artifacts)
            })
            .collect()
    }

    fn run_artifacts(&self, run_id: i64) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, sha256 FROM run_artifacts WHERE run_id = ?1 ORDER BY path")?;
        let artifacts = stmt
            .query_map(params![run_id], |row| {
                Ok(Artifact {
                    path: row.get(0)?,
                    sha256: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    /// Finalize a Run outside a state transition. Fails if already final.
    pub fn finalize_run(&self, run_id: i64, fin: &RunFinal) -> Result<Run> {
        let tx = self.conn.unchecked_transaction()?;
        write_run_final(&tx, run_id, fin)?;
        tx.commit()?;
        self.get_run(run_id)
    }

    /// Latest Run among `kinds` whose outcome reached the state machine.
    /// Running, cancelled and parked Runs are skipped.
    pub fn last_completed_run(&self, slice_id: i64, kinds: &[RunKind]) -> Result<Option<Run>> {
        Ok(self
            .list_runs(slice_id)?
            .into_iter()
            .rev()
            .find(|run| {
                kinds.contains(&run.kind)
                    && !run.parked
                    && run.status.step_outcome().is_some()
            }))
    }

    // ── Gate results ──────────────────────────────────────────────────

    pub fn insert_gate_results(&self, run_id: i64, results: &[GateResult]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (position, result) in results.iter().enumerate() {
            tx.execute(
                "INSERT INTO gate_results (run_id, position, name, passed, failure, exit_code,
                                           stdout, stderr, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    position as i64,
                    result.name,
                    result.passed,
                    result.failure.map(|f| f.as_str()),
                    result.exit_code,
                    result.stdout,
                    result.stderr,
                    result.duration_ms as i64,
                ],
            )
            .context("Failed to insert gate result")?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn gate_results(&self, run_id: i64) -> Result<Vec<GateResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, passed, failure, exit_code, stdout, stderr, duration_ms
             FROM gate_results WHERE run_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i32>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(name, passed, failure, exit_code, stdout, stderr, duration_ms)| {
                Ok(GateResult {
                    name,
                    passed,
                    failure: failure.as_deref().map(parse).transpose()?,
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: duration_ms.max(0) as u64,
                })
            })
            .collect()
    }

    /// Most recent finished gates Run for a slice, with its results.
    pub fn latest_gate_run(&self, slice_id: i64) -> Result<Option<(Run, Vec<GateResult>)>> {
        let run = self
            .list_runs(slice_id)?
            .into_iter()
            .rev()
            .find(|run| run.kind == RunKind::Step(Step::Gates) && run.status.is_final());
        match run {
            Some(run) => {
                let results = self.gate_results(run.id)?;
                Ok(Some((run, results)))
            }
            None => Ok(None),
        }
    }

    // ── Audit ─────────────────────────────────────────────────────────

    pub fn insert_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry> {
        let id = insert_audit(&self.conn, entry)?;
        self.get_audit(id)
    }

    fn get_audit(&self, id: i64) -> Result<AuditEntry> {
        let sql = format!("SELECT {} FROM audit_entries WHERE id = ?1", AUDIT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], AuditRow::from_row)
            .context("Failed to query audit entry")?;
        row.into_entry()
    }

    pub fn list_audit(&self, subject: Option<(SubjectKind, i64)>) -> Result<Vec<AuditEntry>> {
        let (kind, id) = match subject {
            Some((kind, id)) => (Some(kind.as_str()), Some(id)),
            None => (None, None),
        };
        let sql = format!(
            "SELECT {} FROM audit_entries
             WHERE (?1 IS NULL OR subject_kind = ?1) AND (?2 IS NULL OR subject_id = ?2)
             ORDER BY id",
            AUDIT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![kind, id], AuditRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list audit entries")?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    // ── Quadrants & traceability ──────────────────────────────────────

    pub fn get_quadrants(&self, slice_id: i64) -> Result<Option<Quadrants>> {
        self.conn
            .query_row(
                "SELECT functional_core, physical_constraints, semantic_contract, exceptions
                 FROM slice_quadrants WHERE slice_id = ?1",
                params![slice_id],
                |row| {
                    Ok(Quadrants {
                        functional_core: row.get(0)?,
                        physical_constraints: row.get(1)?,
                        semantic_contract: row.get(2)?,
                        exceptions: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query quadrants")
    }

    /// Store the quadrants, insert trace items whose code is new and seed
    /// the control table if the slice has none. Returns how many trace and
    /// control items were added.
    pub fn save_quadrants(
        &self,
        slice_id: i64,
        quadrants: &Quadrants,
        traces: &[NewTraceItem],
        controls: &[NewControlItem],
    ) -> Result<(usize, usize)> {
        self.get_slice(slice_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let ts = now();
        tx.execute(
            "INSERT INTO slice_quadrants (slice_id, functional_core, physical_constraints,
                                          semantic_contract, exceptions, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(slice_id) DO UPDATE SET
                functional_core = excluded.functional_core,
                physical_constraints = excluded.physical_constraints,
                semantic_contract = excluded.semantic_contract,
                exceptions = excluded.exceptions,
                updated_at = excluded.updated_at",
            params![
                slice_id,
                quadrants.functional_core,
                quadrants.physical_constraints,
                quadrants.semantic_contract,
                quadrants.exceptions,
                ts,
            ],
        )
        .context("Failed to store quadrants")?;

        let mut traces_added = 0;
        for trace in traces {
            traces_added += tx
                .execute(
                    "INSERT OR IGNORE INTO trace_items
                        (slice_id, code, category, text, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![slice_id, trace.code, trace.category.as_str(), trace.text, ts],
                )
                .context("Failed to insert trace item")?;
        }

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM control_items WHERE slice_id = ?1",
            params![slice_id],
            |row| row.get(0),
        )?;
        let mut controls_added = 0;
        if existing == 0 {
            for control in controls {
                tx.execute(
                    "INSERT INTO control_items
                        (slice_id, layer, item, source, tracking, acceptance, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        slice_id,
                        control.layer.as_str(),
                        control.item,
                        control.source,
                        control.tracking,
                        control.acceptance,
                        ts,
                    ],
                )
                .context("Failed to insert control item")?;
                controls_added += 1;
            }
        }
        tx.commit()?;
        Ok((traces_added, controls_added))
    }

    pub fn list_trace_items(&self, slice_id: i64) -> Result<Vec<TraceItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, slice_id, code, category, text, target_files, commit_sha, status, notes,
                    updated_at
             FROM trace_items WHERE slice_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![slice_id], TraceRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list trace items")?;
        rows.into_iter().map(TraceRow::into_item).collect()
    }

    /// Write audited trace items and their coverage report in one
    /// transaction. Returns the stored report.
    pub fn record_trace_audit(
        &self,
        items: &[TraceItem],
        report: &CoverageReport,
    ) -> Result<CoverageReport> {
        let findings =
            serde_json::to_string(&report.findings).context("Failed to encode findings")?;
        let tx = self.conn.unchecked_transaction()?;
        let ts = now();
        for item in items {
            let targets =
                serde_json::to_string(&item.target_files).context("Failed to encode targets")?;
            tx.execute(
                "UPDATE trace_items
                 SET target_files = ?1, commit_sha = ?2, status = ?3, notes = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    targets,
                    item.commit_sha,
                    item.status.as_str(),
                    item.notes,
                    ts,
                    item.id,
                ],
            )
            .context("Failed to update trace item")?;
        }
        tx.execute(
            "INSERT INTO coverage_reports
                (slice_id, run_id, total, passed, failed, coverage, findings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.slice_id,
                report.run_id,
                report.total as i64,
                report.passed as i64,
                report.failed as i64,
                report.coverage,
                findings,
                ts,
            ],
        )
        .context("Failed to insert coverage report")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(CoverageReport {
            id,
            created_at: ts,
            ..report.clone()
        })
    }

    pub fn latest_coverage_report(&self, slice_id: i64) -> Result<Option<CoverageReport>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, slice_id, run_id, total, passed, failed, coverage, findings, created_at
                 FROM coverage_reports WHERE slice_id = ?1 ORDER BY id DESC LIMIT 1",
                params![slice_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query coverage report")?;
        row.map(
            |(id, slice_id, run_id, total, passed, failed, coverage, findings, created_at)| {
                Ok(CoverageReport {
                    id,
                    slice_id,
                    run_id,
                    total: total.max(0) as usize,
                    passed: passed.max(0) as usize,
                    failed: failed.max(0) as usize,
                    coverage,
                    findings: serde_json::from_str(&findings)
                        .context("Failed to decode findings")?,
                    created_at,
                })
            },
        )
        .transpose()
    }

    const CONTROL_COLUMNS: &'static str =
        "id, slice_id, layer, item, source, tracking, acceptance, status, updated_by, updated_at";

    pub fn list_control_items(&self, slice_id: i64) -> Result<Vec<ControlItem>> {
        let sql = format!(
            "SELECT {} FROM control_items WHERE slice_id = ?1 ORDER BY id",
            Self::CONTROL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![slice_id], ControlRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list control items")?;
        rows.into_iter().map(ControlRow::into_item).collect()
    }

    pub fn set_control_status(
        &self,
        slice_id: i64,
        item_id: i64,
        status: ControlStatus,
        user: &str,
    ) -> Result<ControlItem> {
        let changed = self
            .conn
            .execute(
                "UPDATE control_items SET status = ?1, updated_by = ?2, updated_at = ?3
                 WHERE id = ?4 AND slice_id = ?5",
                params![status.as_str(), user, now(), item_id, slice_id],
            )
            .context("Failed to update control item")?;
        if changed == 0 {
            return Err(SliceError::NotFound {
                kind: "Control item",
                id: item_id,
            }
            .into());
        }
        let sql = format!(
            "SELECT {} FROM control_items WHERE id = ?1",
            Self::CONTROL_COLUMNS
        );
        self.conn
            .query_row(&sql, params![item_id], ControlRow::from_row)
            .context("Failed to query control item")?
            .into_item()
    }

    // ── LLM configuration layers ──────────────────────────────────────

    pub fn user_llm_settings(&self, user_id: &str) -> Result<Option<LlmSettings>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT settings FROM user_llm_configs WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("Corrupt user LLM settings"))
            .transpose()
    }

    pub fn project_llm_settings(&self, project_id: i64) -> Result<Option<LlmSettings>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT settings FROM project_llm_configs WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("Corrupt project LLM settings"))
            .transpose()
    }

    pub fn set_user_llm_settings(&self, user_id: &str, settings: &LlmSettings) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_llm_configs (user_id, settings, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET settings = excluded.settings,
                                                updated_at = excluded.updated_at",
            params![user_id, serde_json::to_string(settings)?, now()],
        )?;
        Ok(())
    }

    pub fn set_project_llm_settings(&self, project_id: i64, settings: &LlmSettings) -> Result<()> {
        self.get_project(project_id)?;
        self.conn.execute(
            "INSERT INTO project_llm_configs (project_id, settings, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET settings = excluded.settings,
                                                   updated_at = excluded.updated_at",
            params![project_id, serde_json::to_string(settings)?, now()],
        )?;
        Ok(())
    }
}

fn write_run_final(conn: &Connection, run_id: i64, fin: &RunFinal) -> Result<()> {
    let status = fin.status();
    anyhow::ensure!(status.is_final(), "Run {} cannot be finalized as running", run_id);
    let changed = conn
        .execute(
            "UPDATE runs SET status = ?1, attempts = ?2, output = ?3, error = ?4, commit_sha = ?5,
                             finished_at = ?6, parked = ?7
             WHERE id = ?8 AND status = 'running'",
            params![
                status.as_str(),
                fin.attempts,
                fin.output,
                fin.error,
                fin.commit_sha,
                now(),
                fin.parked,
                run_id,
            ],
        )
        .context("Failed to finalize run")?;
    anyhow::ensure!(changed == 1, "Run {} is already final", run_id);
    for artifact in &fin.artifacts {
        conn.execute(
            "INSERT OR REPLACE INTO run_artifacts (run_id, path, sha256) VALUES (?1, ?2, ?3)",
            params![run_id, artifact.path, artifact.sha256],
        )
        .context("Failed to insert run artifact")?;
    }
    Ok(())
}

fn insert_audit(conn: &Connection, entry: &NewAuditEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_entries (entry_id, timestamp, actor_kind, actor_id, action,
                                    subject_kind, subject_id, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            now(),
            entry.actor.kind.as_str(),
            entry.actor.id,
            entry.action,
            entry.subject_kind.as_str(),
            entry.subject_id,
            entry.payload.to_string(),
        ],
    )
    .context("Failed to append audit entry")?;
    Ok(conn.last_insert_rowid())
}

const AUDIT_COLUMNS: &str =
    "id, entry_id, timestamp, actor_kind, actor_id, action, subject_kind, subject_id, payload";

struct AuditRow {
    id: i64,
    entry_id: String,
    timestamp: String,
    actor_kind: String,
    actor_id: String,
    action: String,
    subject_kind: String,
    subject_id: i64,
    payload: String,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entry_id: row.get(1)?,
            timestamp: row.get(2)?,
            actor_kind: row.get(3)?,
            actor_id: row.get(4)?,
            action: row.get(5)?,
            subject_kind: row.get(6)?,
            subject_id: row.get(7)?,
            payload: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            id: self.id,
            entry_id: Uuid::parse_str(&self.entry_id).context("Corrupt audit entry id")?,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .context("Corrupt audit timestamp")?
                .with_timezone(&Utc),
            actor_kind: parse(&self.actor_kind)?,
            actor_id: self.actor_id,
            action: self.action,
            subject_kind: parse(&self.subject_kind)?,
            subject_id: self.subject_id,
            payload: serde_json::from_str(&self.payload).context("Corrupt audit payload")?,
        })
    }
}

struct SliceRow {
    id: i64,
    project_id: i64,
    title: String,
    scope: String,
    out_of_scope: String,
    risk_level: String,
    acceptance: String,
    branch_name: String,
    state: String,
    failed_step: Option<String>,
    version: i64,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SliceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            scope: row.get(3)?,
            out_of_scope: row.get(4)?,
            risk_level: row.get(5)?,
            acceptance: row.get(6)?,
            branch_name: row.get(7)?,
            state: row.get(8)?,
            failed_step: row.get(9)?,
            version: row.get(10)?,
            pr_number: row.get(11)?,
            pr_url: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_slice(self) -> Result<Slice> {
        Ok(Slice {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            scope: self.scope,
            out_of_scope: self.out_of_scope,
            risk_level: parse(&self.risk_level)?,
            acceptance: serde_json::from_str(&self.acceptance)
                .context("Corrupt acceptance criteria")?,
            branch_name: self.branch_name,
            state: parse(&self.state)?,
            failed_step: self.failed_step.as_deref().map(parse).transpose()?,
            version: self.version,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RunRow {
    id: i64,
    slice_id: i64,
    kind: String,
    status: String,
    attempts: u32,
    output: String,
    error: Option<String>,
    commit_sha: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    parked: bool,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slice_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            output: row.get(5)?,
            error: row.get(6)?,
            commit_sha: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
            parked: row.get(10)?,
        })
    }

    fn into_run(self, artifacts: Vec<Artifact>) -> Result<Run> {
        Ok(Run {
            id: self.id,
            slice_id: self.slice_id,
            kind: parse(&self.kind)?,
            status: parse(&self.status)?,
            attempts: self.attempts,
            output: self.output,
            error: self.error,
            commit_sha: self.commit_sha,
            artifacts,
            parked: self.parked,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

struct TraceRow {
    id: i64,
    slice_id: i64,
    code: String,
    category: String,
    text: String,
    target_files: String,
    commit_sha: Option<String>,
    status: String,
    notes: Option<String>,
    updated_at: String,
}

impl TraceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slice_id: row.get(1)?,
            code: row.get(2)?,
            category: row.get(3)?,
            text: row.get(4)?,
            target_files: row.get(5)?,
            commit_sha: row.get(6)?,
            status: row.get(7)?,
            notes: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_item(self) -> Result<TraceItem> {
        Ok(TraceItem {
            id: self.id,
            slice_id: self.slice_id,
            code: self.code,
            category: parse(&self.category)?,
            text: self.text,
            target_files: serde_json::from_str(&self.target_files)
                .context("Failed to decode trace targets")?,
            commit_sha: self.commit_sha,
            status: parse(&self.status)?,
            notes: self.notes,
            updated_at: self.updated_at,
        })
    }
}

struct ControlRow {
    id: i64,
    slice_id: i64,
    layer: String,
    item: String,
    source: String,
    tracking: String,
    acceptance: String,
    status: String,
    updated_by: Option<String>,
    updated_at: String,
}

impl ControlRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slice_id: row.get(1)?,
            layer: row.get(2)?,
            item: row.get(3)?,
            source: row.get(4)?,
            tracking: row.get(5)?,
            acceptance: row.get(6)?,
            status: row.get(7)?,
            updated_by: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_item(self) -> Result<ControlItem> {
        Ok(ControlItem {
            id: self.id,
            slice_id: self.slice_id,
            layer: parse(&self.layer)?,
            item: self.item,
            source: self.source,
            tracking: self.tracking,
            acceptance: self.acceptance,
            status: parse(&self.status)?,
            updated_by: self.updated_by,
            updated_at: self.updated_at,
        })
    }
}
