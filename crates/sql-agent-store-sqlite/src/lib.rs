#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row};
use sql_agent_domain::{
    format_rfc3339, now_utc, parse_rfc3339, EventRow, InteractionRecord, NewInteraction, RunId,
    RunRecord, RunStatus, SessionId, TraceEvent, TraceEventType,
};
use sql_agent_store_core::{HistoryStore, TraceStore};
use ulid::Ulid;

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interactions (
  interaction_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id TEXT NOT NULL,
  user_query TEXT NOT NULL,
  generated_sql TEXT NOT NULL,
  result_summary TEXT NOT NULL,
  is_successful INTEGER NOT NULL CHECK (is_successful IN (0,1)),
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  session_id TEXT NOT NULL,
  query TEXT NOT NULL,
  caller_role TEXT,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','faulted')),
  outcome TEXT,
  message_count INTEGER NOT NULL DEFAULT 0,
  engine_version TEXT NOT NULL,
  config_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trace_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  stage TEXT,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_interactions_session_seq ON interactions(session_id, interaction_seq);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id, started_at);
CREATE INDEX IF NOT EXISTS idx_trace_events_run_seq ON trace_events(run_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_interactions_no_update
BEFORE UPDATE ON interactions
BEGIN
  SELECT RAISE(FAIL, 'interactions are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_update
BEFORE UPDATE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_delete
BEFORE DELETE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
";

const RUN_COLUMNS: &str = "run_id, session_id, query, caller_role, started_at, ended_at,
    status, outcome, message_count, engine_version, config_json";

/// `SQLite` persistence for conversation history and run traces.
///
/// One connection guarded by a mutex, so appends from concurrent runs are
/// serialized in commit order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store database, configure local pragmas and apply the schema.
    ///
    /// # Errors
    /// Returns an error if opening the database, applying pragmas, or applying
    /// the schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store. Nothing survives the process.
    ///
    /// # Errors
    /// Returns an error if the in-memory database cannot be configured.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite store connection lock poisoned"))
    }
}

/// Creates the history and trace tables; safe to repeat.
fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_V1)
        .context("failed to apply store schema")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![STORE_SCHEMA_VERSION, format_rfc3339(now_utc())?],
    )
    .context("failed to record store migration")?;

    Ok(())
}

impl HistoryStore for SqliteStore {
    fn add_interaction(&self, interaction: &NewInteraction) -> Result<InteractionRecord> {
        let conn = self.conn()?;
        let recorded_at = now_utc();
        conn.execute(
            "INSERT INTO interactions(
                session_id, user_query, generated_sql, result_summary, is_successful, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                interaction.session_id.as_str(),
                interaction.user_query,
                interaction.generated_sql,
                interaction.result_summary,
                bool_to_sql(interaction.is_successful),
                format_rfc3339(recorded_at)?,
            ],
        )
        .context("failed to insert interaction")?;

        Ok(InteractionRecord {
            interaction_seq: conn.last_insert_rowid(),
            session_id: interaction.session_id.clone(),
            user_query: interaction.user_query.clone(),
            generated_sql: interaction.generated_sql.clone(),
            result_summary: interaction.result_summary.clone(),
            is_successful: interaction.is_successful,
            recorded_at,
        })
    }

    fn recent_interactions(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT interaction_seq, session_id, user_query, generated_sql,
                    result_summary, is_successful, recorded_at
             FROM (
                SELECT * FROM interactions
                WHERE session_id = ?1
                ORDER BY interaction_seq DESC
                LIMIT ?2
             )
             ORDER BY interaction_seq ASC",
        )?;

        let limit = i64::try_from(limit).map_err(|_| anyhow!("history limit too large"))?;
        let mut rows = stmt.query(params![session_id.as_str(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let session_raw: String = row.get(1)?;
            out.push(InteractionRecord {
                interaction_seq: row.get(0)?,
                session_id: SessionId(session_raw),
                user_query: row.get(2)?,
                generated_sql: row.get(3)?,
                result_summary: row.get(4)?,
                is_successful: sql_to_bool(row.get::<_, i64>(5)?),
                recorded_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }
        Ok(out)
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT session_id FROM interactions ORDER BY session_id ASC")?;
        let sessions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|value| value.map(SessionId))
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list sessions")?;
        Ok(sessions)
    }

    fn clear_session(&self, session_id: &SessionId) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM interactions WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .context("failed to clear session history")?;
        Ok(removed)
    }
}

impl TraceStore for SqliteStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        apply_schema(&conn)
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs(
                run_id, session_id, query, caller_role, started_at, ended_at,
                status, outcome, message_count, engine_version, config_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id.to_string(),
                run.session_id.as_str(),
                run.query,
                run.caller_role,
                format_rfc3339(run.started_at)?,
                run.ended_at.map(format_rfc3339).transpose()?,
                run.status.as_str(),
                run.outcome,
                i64::try_from(run.message_count)
                    .map_err(|_| anyhow!("message_count too large for sqlite"))?,
                run.engine_version,
                serde_json::to_string(&run.config_json)?,
            ],
        )
        .context("failed to insert run")?;
        Ok(())
    }

    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        outcome: Option<&str>,
        message_count: usize,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE runs SET status = ?2, outcome = ?3, message_count = ?4, ended_at = ?5
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    outcome,
                    i64::try_from(message_count)
                        .map_err(|_| anyhow!("message_count too large for sqlite"))?,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to update run status")?;
        if updated == 0 {
            return Err(anyhow!("unknown run {run_id}"));
        }
        Ok(())
    }

    fn append_event(&self, event: &TraceEvent) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trace_events(
                event_id, run_id, event_type, stage, occurred_at, recorded_at,
                payload_json, payload_hash, prev_event_hash, event_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.event_id.to_string(),
                event.run_id.to_string(),
                event.event_type.as_str(),
                event.stage,
                format_rfc3339(event.occurred_at)?,
                format_rfc3339(now_utc())?,
                serde_json::to_string(&event.payload_json)?,
                event.payload_hash,
                event.prev_event_hash,
                event.event_hash,
            ],
        )
        .context("failed to append trace event")?;

        Ok(conn.last_insert_rowid())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, run_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let run = rows.next()?.map(run_from_row).transpose()?;
        Ok(run)
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                event_seq, event_id, run_id, event_type, stage, occurred_at,
                payload_json, payload_hash, prev_event_hash, event_hash
             FROM trace_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let run_id_raw: String = row.get(2)?;
            let payload_raw: String = row.get(6)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: TraceEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    run_id: RunId::parse(&run_id_raw)?,
                    event_type: parse_event_type(&row.get::<_, String>(3)?)?,
                    stage: row.get(4)?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(7)?,
                    prev_event_hash: row.get(8)?,
                    event_hash: row.get(9)?,
                },
            });
        }

        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    let run_id_raw: String = row.get(0)?;
    let session_raw: String = row.get(1)?;
    let config_raw: String = row.get(10)?;
    let message_count: i64 = row.get(8)?;
    Ok(RunRecord {
        run_id: RunId::parse(&run_id_raw)?,
        session_id: SessionId(session_raw),
        query: row.get(2)?,
        caller_role: row.get(3)?,
        started_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        ended_at: row
            .get::<_, Option<String>>(5)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        status: parse_run_status(&row.get::<_, String>(6)?)?,
        outcome: row.get(7)?,
        message_count: usize::try_from(message_count)
            .map_err(|_| anyhow!("invalid message_count: {message_count}"))?,
        engine_version: row.get(9)?,
        config_json: serde_json::from_str(&config_raw).context("invalid config_json")?,
    })
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value).ok_or_else(|| anyhow!("invalid run status: {value}"))
}

fn parse_event_type(value: &str) -> Result<TraceEventType> {
    TraceEventType::parse(value).ok_or_else(|| anyhow!("invalid event type: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}
