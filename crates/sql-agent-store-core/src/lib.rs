#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use sql_agent_domain::{
    now_utc, EventRow, InteractionRecord, NewInteraction, RunId, RunRecord, RunStatus, SessionId,
    TraceEvent,
};

/// Substring the workflow looks for to decide that a session has no history.
pub const NO_HISTORY_SENTINEL: &str = "No previous conversation history";

pub const NO_HISTORY_TEXT: &str = "No previous conversation history for this session.";

/// Per-session conversation log.
///
/// Appends for one session are serialized by the implementation, so a reader
/// always observes a prefix of the session's interactions in append order.
pub trait HistoryStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn add_interaction(&self, interaction: &NewInteraction) -> Result<InteractionRecord>;

    /// The last `limit` interactions of a session, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn recent_interactions(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_sessions(&self) -> Result<Vec<SessionId>>;

    #[allow(clippy::missing_errors_doc)]
    fn clear_session(&self, session_id: &SessionId) -> Result<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn format_history_for_context(&self, session_id: &SessionId, limit: usize) -> Result<String> {
        Ok(format_history(&self.recent_interactions(session_id, limit)?))
    }
}

/// Render interactions as the transcript embedded in prompts.
#[must_use]
pub fn format_history(records: &[InteractionRecord]) -> String {
    if records.is_empty() {
        return NO_HISTORY_TEXT.to_string();
    }
    let entries: Vec<String> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            format!(
                "{}. User asked: {}\n   SQL: {}\n   Result: {}\n   Status: {}",
                idx + 1,
                record.user_query,
                record.generated_sql,
                record.result_summary,
                if record.is_successful { "success" } else { "failed" },
            )
        })
        .collect();
    format!(
        "Previous conversation history (most recent last):\n\n{}",
        entries.join("\n\n")
    )
}

pub trait TraceStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        outcome: Option<&str>,
        message_count: usize,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &TraceEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;
}

#[derive(Debug, Default)]
struct HistoryLog {
    next_seq: i64,
    records: Vec<InteractionRecord>,
}

/// Process-local history, lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    log: Mutex<HistoryLog>,
}

impl InMemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> Result<MutexGuard<'_, HistoryLog>> {
        self.log
            .lock()
            .map_err(|_| anyhow!("history store lock poisoned"))
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn add_interaction(&self, interaction: &NewInteraction) -> Result<InteractionRecord> {
        let mut log = self.log()?;
        log.next_seq += 1;
        let record = InteractionRecord {
            interaction_seq: log.next_seq,
            session_id: interaction.session_id.clone(),
            user_query: interaction.user_query.clone(),
            generated_sql: interaction.generated_sql.clone(),
            result_summary: interaction.result_summary.clone(),
            is_successful: interaction.is_successful,
            recorded_at: now_utc(),
        };
        log.records.push(record.clone());
        Ok(record)
    }

    fn recent_interactions(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>> {
        let log = self.log()?;
        let mut recent: Vec<InteractionRecord> = log
            .records
            .iter()
            .rev()
            .filter(|record| &record.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let log = self.log()?;
        let sessions: BTreeSet<SessionId> = log
            .records
            .iter()
            .map(|record| record.session_id.clone())
            .collect();
        Ok(sessions.into_iter().collect())
    }

    fn clear_session(&self, session_id: &SessionId) -> Result<usize> {
        let mut log = self.log()?;
        let before = log.records.len();
        log.records.retain(|record| &record.session_id != session_id);
        Ok(before - log.records.len())
    }
}

#[derive(Debug, Default)]
struct TraceLog {
    next_seq: i64,
    runs: Vec<RunRecord>,
    events: Vec<EventRow>,
}

#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    log: Mutex<TraceLog>,
}

impl InMemoryTraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> Result<MutexGuard<'_, TraceLog>> {
        self.log
            .lock()
            .map_err(|_| anyhow!("trace store lock poisoned"))
    }
}

impl TraceStore for InMemoryTraceStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let mut log = self.log()?;
        if log.runs.iter().any(|existing| existing.run_id == run.run_id) {
            return Err(anyhow!("run {} already exists", run.run_id));
        }
        log.runs.push(run.clone());
        Ok(())
    }

    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        outcome: Option<&str>,
        message_count: usize,
    ) -> Result<()> {
        let mut log = self.log()?;
        let run = log
            .runs
            .iter_mut()
            .find(|run| run.run_id == run_id)
            .ok_or_else(|| anyhow!("unknown run {run_id}"))?;
        run.status = status;
        run.outcome = outcome.map(str::to_string);
        run.message_count = message_count;
        run.ended_at = Some(now_utc());
        Ok(())
    }

    fn append_event(&self, event: &TraceEvent) -> Result<i64> {
        let mut log = self.log()?;
        if !log.runs.iter().any(|run| run.run_id == event.run_id) {
            return Err(anyhow!("cannot append event for unknown run {}", event.run_id));
        }
        log.next_seq += 1;
        let event_seq = log.next_seq;
        log.events.push(EventRow {
            event_seq,
            event: event.clone(),
        });
        Ok(event_seq)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let log = self.log()?;
        let mut runs = log.runs.clone();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let log = self.log()?;
        Ok(log.runs.iter().find(|run| run.run_id == run_id).cloned())
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let log = self.log()?;
        Ok(log
            .events
            .iter()
            .filter(|row| row.event.run_id == run_id)
            .cloned()
            .collect())
    }
}
