use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::models::*;
use crate::signals::Role;

/// Async-safe handle to the plan database.
///
/// All access runs on tokio's blocking pool so SQLite I/O never occupies an
/// async worker thread.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<PlanDb>>,
}

impl SqliteStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::from_db(PlanDb::new(path)?))
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self::from_db(PlanDb::new_in_memory()?))
    }

    pub fn from_db(db: PlanDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PlanDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_plan(&self, name: &str, content: &str) -> Result<Plan> {
        let (name, content) = (name.to_string(), content.to_string());
        self.call(move |db| db.create_plan(&name, &content)).await
    }

    async fn get_plan(&self, id: i64) -> Result<Option<Plan>> {
        self.call(move |db| db.get_plan(id)).await
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        self.call(|db| db.list_plans()).await
    }

    async fn update_plan_status(&self, id: i64, status: PlanStatus) -> Result<()> {
        self.call(move |db| db.update_plan_status(id, status)).await
    }

    async fn update_plan_base_revision(&self, id: i64, revision: &str) -> Result<()> {
        let revision = revision.to_string();
        self.call(move |db| db.update_plan_base_revision(id, &revision))
            .await
    }

    async fn get_latest_session(&self, plan_id: i64) -> Result<Option<TurnSession>> {
        self.call(move |db| db.get_latest_session(plan_id)).await
    }

    async fn create_session(
        &self,
        plan_id: i64,
        iteration: u32,
        role: Role,
        prompt: &str,
    ) -> Result<TurnSession> {
        let prompt = prompt.to_string();
        self.call(move |db| db.create_session(plan_id, iteration, role, &prompt))
            .await
    }

    async fn complete_session(
        &self,
        session_id: i64,
        output: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let output = output.to_string();
        self.call(move |db| db.complete_session(session_id, &output, status))
            .await
    }

    async fn get_latest_progress(&self, plan_id: i64) -> Result<Option<String>> {
        self.call(move |db| db.get_latest_note(NoteKind::Progress, plan_id))
            .await
    }

    async fn get_latest_learnings(&self, plan_id: i64) -> Result<Option<String>> {
        self.call(move |db| db.get_latest_note(NoteKind::Learnings, plan_id))
            .await
    }

    async fn get_latest_feedback(&self, plan_id: i64) -> Result<Option<String>> {
        self.call(move |db| db.get_latest_feedback(plan_id)).await
    }

    async fn create_progress(&self, session_id: i64, content: &str) -> Result<()> {
        let content = content.to_string();
        self.call(move |db| db.create_note(NoteKind::Progress, session_id, &content))
            .await
    }

    async fn create_learnings(&self, session_id: i64, content: &str) -> Result<()> {
        let content = content.to_string();
        self.call(move |db| db.create_note(NoteKind::Learnings, session_id, &content))
            .await
    }

    async fn create_feedback(&self, plan_id: i64, session_id: i64, content: &str) -> Result<()> {
        let content = content.to_string();
        self.call(move |db| db.create_feedback(plan_id, session_id, &content))
            .await
    }

    async fn clear_feedback(&self, plan_id: i64) -> Result<()> {
        self.call(move |db| db.clear_feedback(plan_id)).await
    }

    async fn create_raw_event(
        &self,
        session_id: i64,
        seq: u64,
        kind: &str,
        raw: &str,
    ) -> Result<()> {
        let (kind, raw) = (kind.to_string(), raw.to_string());
        self.call(move |db| db.create_raw_event(session_id, seq, &kind, &raw))
            .await
    }
}

/// The two append-only narrative tables share one shape.
#[derive(Debug, Clone, Copy)]
pub enum NoteKind {
    Progress,
    Learnings,
}

impl NoteKind {
    fn table(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Learnings => "learnings",
        }
    }
}

pub struct PlanDb {
    conn: Connection,
}

impl PlanDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

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
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                base_revision TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan_id INTEGER NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
                iteration INTEGER NOT NULL,
                role TEXT NOT NULL,
                prompt TEXT NOT NULL,
                output TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS learnings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan_id INTEGER NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS raw_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                raw TEXT NOT NULL,
                UNIQUE(session_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_plan ON sessions(plan_id, iteration);
            CREATE INDEX IF NOT EXISTS idx_progress_session ON progress(session_id);
            CREATE INDEX IF NOT EXISTS idx_learnings_session ON learnings(session_id);
            CREATE INDEX IF NOT EXISTS idx_feedback_plan ON feedback(plan_id);
            CREATE INDEX IF NOT EXISTS idx_raw_events_session ON raw_events(session_id);
            ",
        )?;
        Ok(())
    }

    // ── Plans ─────────────────────────────────────────────────────────

    pub fn create_plan(&self, name: &str, content: &str) -> Result<Plan> {
        let now = now();
        self.conn
            .execute(
                "INSERT INTO plans (name, content, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, content, PlanStatus::Pending.as_str(), now],
            )
            .context("Failed to insert plan")?;
        let id = self.conn.last_insert_rowid();
        self.get_plan(id)?.context("Plan not found after insert")
    }

    pub fn get_plan(&self, id: i64) -> Result<Option<Plan>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, content, status, base_revision, created_at, updated_at
                 FROM plans WHERE id = ?1",
                params![id],
                PlanRow::from_row,
            )
            .optional()
            .context("Failed to query plan")?;
        row.map(PlanRow::into_plan).transpose()
    }

    pub fn list_plans(&self) -> Result<Vec<Plan>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, content, status, base_revision, created_at, updated_at
                 FROM plans ORDER BY id",
            )
            .context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map([], PlanRow::from_row)
            .context("Failed to query plans")?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(row.context("Failed to read plan row")?.into_plan()?);
        }
        Ok(plans)
    }

    pub fn update_plan_status(&self, id: i64, status: PlanStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE plans SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now(), id],
            )
            .context("Failed to update plan status")?;
        if changed == 0 {
            bail!("Plan {} not found", id);
        }
        Ok(())
    }

    /// Record the base revision. A revision that is already set is kept.
    pub fn update_plan_base_revision(&self, id: i64, revision: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE plans SET base_revision = ?1, updated_at = ?2
                 WHERE id = ?3 AND base_revision IS NULL",
                params![revision, now(), id],
            )
            .context("Failed to update plan base revision")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        plan_id: i64,
        iteration: u32,
        role: Role,
        prompt: &str,
    ) -> Result<TurnSession> {
        self.conn
            .execute(
                "INSERT INTO sessions (plan_id, iteration, role, prompt, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    plan_id,
                    iteration,
                    role.as_str(),
                    prompt,
                    SessionStatus::Running.as_str(),
                    now()
                ],
            )
            .context("Failed to insert session")?;
        let id = self.conn.last_insert_rowid();
        self.get_session(id)?
            .context("Session not found after insert")
    }

    pub fn get_session(&self, id: i64) -> Result<Option<TurnSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, plan_id, iteration, role, prompt, output, status, started_at, completed_at
                 FROM sessions WHERE id = ?1",
                params![id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    pub fn get_latest_session(&self, plan_id: i64) -> Result<Option<TurnSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, plan_id, iteration, role, prompt, output, status, started_at, completed_at
                 FROM sessions WHERE plan_id = ?1
                 ORDER BY iteration DESC, id DESC LIMIT 1",
                params![plan_id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query latest session")?;
        row.map(SessionRow::into_session).transpose()
    }

    pub fn complete_session(
        &self,
        session_id: i64,
        output: &str,
        status: SessionStatus,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET output = ?1, status = ?2, completed_at = ?3 WHERE id = ?4",
                params![output, status.as_str(), now(), session_id],
            )
            .context("Failed to complete session")?;
        Ok(())
    }

    // ── Narrative ─────────────────────────────────────────────────────

    pub fn create_note(&self, kind: NoteKind, session_id: i64, content: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (session_id, content, created_at) VALUES (?1, ?2, ?3)",
            kind.table()
        );
        self.conn
            .execute(&sql, params![session_id, content, now()])
            .with_context(|| format!("Failed to insert {}", kind.table()))?;
        Ok(())
    }

    pub fn get_latest_note(&self, kind: NoteKind, plan_id: i64) -> Result<Option<String>> {
        let sql = format!(
            "SELECT n.content FROM {} n JOIN sessions s ON s.id = n.session_id
             WHERE s.plan_id = ?1 ORDER BY n.id DESC LIMIT 1",
            kind.table()
        );
        self.conn
            .query_row(&sql, params![plan_id], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to query latest {}", kind.table()))
    }

    pub fn create_feedback(&self, plan_id: i64, session_id: i64, content: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO feedback (plan_id, session_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![plan_id, session_id, content, now()],
            )
            .context("Failed to insert feedback")?;
        Ok(())
    }

    pub fn get_latest_feedback(&self, plan_id: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT content FROM feedback WHERE plan_id = ?1 ORDER BY id DESC LIMIT 1",
                params![plan_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query latest feedback")
    }

    pub fn clear_feedback(&self, plan_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM feedback WHERE plan_id = ?1", params![plan_id])
            .context("Failed to clear feedback")?;
        Ok(())
    }

    // ── Raw events ────────────────────────────────────────────────────

    pub fn create_raw_event(&self, session_id: i64, seq: u64, kind: &str, raw: &str) -> Result<()> {
        let seq = i64::try_from(seq).context("Raw event sequence out of range")?;
        self.conn
            .execute(
                "INSERT INTO raw_events (session_id, seq, kind, raw) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, seq, kind, raw],
            )
            .context("Failed to insert raw event")?;
        Ok(())
    }

    pub fn get_raw_events(&self, session_id: i64) -> Result<Vec<RawEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, seq, kind, raw FROM raw_events
                 WHERE session_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare get_raw_events")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let seq: i64 = row.get(2)?;
                Ok(RawEvent {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    seq: seq.max(0) as u64,
                    kind: row.get(3)?,
                    raw: row.get(4)?,
                })
            })
            .context("Failed to query raw events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read raw event row")?);
        }
        Ok(events)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

struct PlanRow {
    id: i64,
    name: String,
    content: String,
    status: String,
    base_revision: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PlanRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            content: row.get(2)?,
            status: row.get(3)?,
            base_revision: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_plan(self) -> Result<Plan> {
        let status = PlanStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse plan status")?;
        Ok(Plan {
            id: self.id,
            name: self.name,
            content: self.content,
            status,
            base_revision: self.base_revision,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct SessionRow {
    id: i64,
    plan_id: i64,
    iteration: u32,
    role: String,
    prompt: String,
    output: Option<String>,
    status: String,
    started_at: String,
    completed_at: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plan_id: row.get(1)?,
            iteration: row.get(2)?,
            role: row.get(3)?,
            prompt: row.get(4)?,
            output: row.get(5)?,
            status: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_session(self) -> Result<TurnSession> {
        let role = Role::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session role")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        Ok(TurnSession {
            id: self.id,
            plan_id: self.plan_id,
            iteration: self.iteration,
            role,
            prompt: self.prompt,
            output: self.output,
            status,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}
