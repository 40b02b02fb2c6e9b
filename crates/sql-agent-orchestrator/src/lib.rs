#![forbid(unsafe_code)]

use anyhow::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sql_agent_domain::{
    ensure_non_empty, format_rfc3339, hash_bytes, hash_json, now_utc, AgentConfig, EventRow,
    Message, RunId, RunRecord, RunStatus, SessionId, TraceEvent, TraceEventType,
};
use sql_agent_provider::LanguageModel;
use sql_agent_safety::SqlGuard;
use sql_agent_store_core::{HistoryStore, TraceStore};
use sql_agent_warehouse::QueryExecutor;
use sql_agent_workflow::{Stage, StageDisposition, WorkflowEngine, WorkflowState};
use ulid::Ulid;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub caller_role: Option<String>,
    pub run_id: Option<RunId>,
}

impl RunRequest {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    pub state: WorkflowState,
}

impl RunOutput {
    /// The last message of the run, which is what a caller shows as the answer.
    #[must_use]
    pub fn final_answer(&self) -> Option<&str> {
        self.messages.last().map(|message| message.content.as_str())
    }

    #[must_use]
    pub fn generated_sql(&self) -> Option<&str> {
        self.state.outcome.sql()
    }

    #[must_use]
    pub fn outcome(&self) -> &'static str {
        self.state.outcome.label()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
}

/// Single entry point: one request in, one traced workflow run out.
pub struct SessionOrchestrator<'a> {
    llm: &'a dyn LanguageModel,
    executor: &'a dyn QueryExecutor,
    guard: &'a dyn SqlGuard,
    history: &'a dyn HistoryStore,
    trace_store: &'a dyn TraceStore,
    config: AgentConfig,
}

impl<'a> SessionOrchestrator<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LanguageModel,
        executor: &'a dyn QueryExecutor,
        guard: &'a dyn SqlGuard,
        history: &'a dyn HistoryStore,
        trace_store: &'a dyn TraceStore,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            guard,
            history,
            trace_store,
            config,
        }
    }

    /// Answer one question within a session, generating a session id when none is given.
    ///
    /// # Errors
    /// Returns an error when a collaborator fails or the trace cannot be written.
    pub fn run(&self, query: &str, session_id: Option<&str>) -> Result<RunOutput> {
        self.run_request(RunRequest {
            query: query.to_string(),
            session_id: session_id.map(str::to_string),
            ..RunRequest::default()
        })
    }

    /// Execute all workflow stages for a request and persist the run trace.
    ///
    /// Out-of-scope, blocked, failed-query and no-history outcomes complete
    /// normally. Only collaborator or persistence failures are errors; the run
    /// is then recorded as faulted before the error is returned.
    ///
    /// # Errors
    /// Returns an error for an empty query, a collaborator failure, or a trace
    /// persistence failure.
    pub fn run_request(&self, request: RunRequest) -> Result<RunOutput> {
        let RunRequest {
            query,
            session_id,
            caller_role,
            run_id,
        } = request;
        ensure_non_empty("query", &query)?;
        self.trace_store.migrate()?;

        let run_id = run_id.unwrap_or_default();
        let session_id = session_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(SessionId::generate, SessionId::from);

        let run = RunRecord {
            run_id,
            session_id: session_id.clone(),
            query: query.clone(),
            caller_role: caller_role.clone(),
            started_at: now_utc(),
            ended_at: None,
            status: RunStatus::Running,
            outcome: None,
            message_count: 0,
            engine_version: self.config.engine_version.clone(),
            config_json: serde_json::to_value(&self.config)?,
        };
        self.trace_store.insert_run(&run)?;

        let mut chain = EventChain::default();
        let mut state = WorkflowState::new(session_id.clone(), query);
        let mut current_stage = None;
        if let Err(err) = self.drive(
            run_id,
            caller_role.as_deref(),
            &mut state,
            &mut chain,
            &mut current_stage,
        ) {
            return Err(self.record_fault(run_id, current_stage, &state, err, &mut chain));
        }
        tracing::info!(%run_id, %session_id, outcome = state.outcome.label(), "run finished");

        Ok(RunOutput {
            run_id,
            session_id,
            messages: state.messages.clone(),
            state,
        })
    }

    /// Everything after the run row exists. Any failure here faults the run.
    fn drive(
        &self,
        run_id: RunId,
        caller_role: Option<&str>,
        state: &mut WorkflowState,
        chain: &mut EventChain,
        current_stage: &mut Option<Stage>,
    ) -> Result<()> {
        self.emit_event(
            run_id,
            None,
            TraceEventType::RunStarted,
            json!({
                "session_id": state.session_id,
                "query_hash": hash_bytes(state.query.as_bytes()),
                "caller_role": caller_role,
                "language_model": self.llm.name(),
                "query_executor": self.executor.name(),
            }),
            chain,
        )?;
        tracing::info!(%run_id, session_id = %state.session_id, "run started");

        let engine = WorkflowEngine::new(
            self.llm,
            self.executor,
            self.guard,
            self.history,
            self.config.clone(),
        );

        for stage in Stage::ALL {
            *current_stage = Some(stage);
            self.emit_event(
                run_id,
                Some(stage),
                TraceEventType::StageStarted,
                json!({ "outcome": state.outcome.label() }),
                chain,
            )?;

            let messages_before = state.messages.len();
            let report = engine.run_stage(stage, state)?;

            let event_type = match report.disposition {
                StageDisposition::Ran => TraceEventType::StageFinished,
                StageDisposition::Skipped => TraceEventType::StageSkipped,
            };
            self.emit_event(
                run_id,
                Some(stage),
                event_type,
                json!({
                    "detail": report.detail,
                    "outcome": state.outcome.label(),
                    "messages_added": state.messages.len() - messages_before,
                }),
                chain,
            )?;
        }
        *current_stage = None;

        let outcome = state.outcome.label();
        self.emit_event(
            run_id,
            None,
            TraceEventType::RunFinished,
            json!({
                "outcome": outcome,
                "sql": state.outcome.sql(),
                "retry_count": state.retry_count,
                "message_count": state.messages.len(),
            }),
            chain,
        )?;
        self.trace_store.finish_run(
            run_id,
            RunStatus::Completed,
            Some(outcome),
            state.messages.len(),
        )
    }

    /// Reconstruct and verify the event hash chain for a recorded run.
    ///
    /// # Errors
    /// Returns an error when trace rows cannot be read.
    pub fn replay_audit(&self, run_id: RunId) -> Result<ReplayReport> {
        let events = self.trace_store.list_events_for_run(run_id)?;
        let mut prev: Option<String> = None;
        for row in &events {
            if row.event.prev_event_hash != prev || !event_hashes_match(&row.event)? {
                return Ok(ReplayReport {
                    run_id,
                    events: events.len(),
                    chain_valid: false,
                });
            }
            prev = Some(row.event.event_hash.clone());
        }

        Ok(ReplayReport {
            run_id,
            events: events.len(),
            chain_valid: true,
        })
    }

    fn record_fault(
        &self,
        run_id: RunId,
        stage: Option<Stage>,
        state: &WorkflowState,
        err: Error,
        chain: &mut EventChain,
    ) -> Error {
        let stage_name = stage.map_or("run", Stage::as_str);
        tracing::error!(%run_id, stage = stage_name, error = %format!("{err:#}"), "run faulted");
        let recorded = self
            .emit_event(
                run_id,
                stage,
                TraceEventType::Error,
                json!({
                    "error": format!("{err:#}"),
                    "outcome": state.outcome.label(),
                }),
                chain,
            )
            .and_then(|_| {
                self.trace_store.finish_run(
                    run_id,
                    RunStatus::Faulted,
                    Some(state.outcome.label()),
                    state.messages.len(),
                )
            });
        if let Err(trace_err) = recorded {
            tracing::error!(%run_id, error = %format!("{trace_err:#}"), "failed to record run fault");
        }
        err
    }

    fn emit_event(
        &self,
        run_id: RunId,
        stage: Option<Stage>,
        event_type: TraceEventType,
        payload_json: Value,
        chain: &mut EventChain,
    ) -> Result<EventRow> {
        let event = TraceEvent {
            event_id: Ulid::new(),
            run_id,
            event_type,
            stage: stage.map(|stage| stage.as_str().to_string()),
            occurred_at: now_utc(),
            payload_hash: hash_json(&payload_json)?,
            payload_json,
            prev_event_hash: chain.prev_event_hash.clone(),
            event_hash: String::new(),
        };
        let event = TraceEvent {
            event_hash: event_hash(&event)?,
            ..event
        };

        let event_seq = self.trace_store.append_event(&event)?;
        chain.prev_event_hash = Some(event.event_hash.clone());

        Ok(EventRow { event_seq, event })
    }
}

#[derive(Debug, Default)]
struct EventChain {
    prev_event_hash: Option<String>,
}

fn event_hash(event: &TraceEvent) -> Result<String> {
    let material = json!({
        "event_id": event.event_id,
        "run_id": event.run_id,
        "event_type": event.event_type,
        "stage": event.stage,
        "occurred_at": format_rfc3339(event.occurred_at)?,
        "payload_hash": event.payload_hash,
        "prev_event_hash": event.prev_event_hash,
    });
    hash_json(&material)
}

fn event_hashes_match(event: &TraceEvent) -> Result<bool> {
    Ok(hash_json(&event.payload_json)? == event.payload_hash && event_hash(event)? == event.event_hash)
}

#[cfg(test)]
mod tests {
    use super::{event_hash, RunRequest, SessionOrchestrator};
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use sql_agent_domain::{
        hash_json, now_utc, AgentConfig, EventRow, RunId, RunRecord, RunStatus, SessionId,
        TraceEvent, TraceEventType,
    };
    use sql_agent_prompts::PromptKind;
    use sql_agent_provider::{MockLanguageModel, ScriptedLanguageModel};
    use sql_agent_safety::SafetyValidator;
    use sql_agent_store_core::{HistoryStore, InMemoryHistoryStore, InMemoryTraceStore, TraceStore};
    use sql_agent_store_sqlite::SqliteStore;
    use sql_agent_warehouse::{QueryRows, ScriptedQueryExecutor};

    /// Trace store that refuses to append one kind of event.
    struct RejectingTraceStore {
        inner: InMemoryTraceStore,
        reject: TraceEventType,
    }

    impl TraceStore for RejectingTraceStore {
        fn migrate(&self) -> Result<()> {
            self.inner.migrate()
        }

        fn insert_run(&self, run: &RunRecord) -> Result<()> {
            self.inner.insert_run(run)
        }

        fn finish_run(
            &self,
            run_id: RunId,
            status: RunStatus,
            outcome: Option<&str>,
            message_count: usize,
        ) -> Result<()> {
            self.inner.finish_run(run_id, status, outcome, message_count)
        }

        fn append_event(&self, event: &TraceEvent) -> Result<i64> {
            if event.event_type == self.reject {
                return Err(anyhow!("disk full"));
            }
            self.inner.append_event(event)
        }

        fn list_runs(&self) -> Result<Vec<RunRecord>> {
            self.inner.list_runs()
        }

        fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
            self.inner.get_run(run_id)
        }

        fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
            self.inner.list_events_for_run(run_id)
        }
    }

    fn validator() -> SafetyValidator {
        SafetyValidator::new().unwrap_or_else(|err| panic!("validator: {err}"))
    }

    fn count_model() -> ScriptedLanguageModel {
        ScriptedLanguageModel::new()
            .with_response(PromptKind::ScopeCheck, "yes")
            .with_response(PromptKind::QuestionType, "NEW_QUERY")
            .with_response(PromptKind::SqlGeneration, "SELECT COUNT(*) FROM CUSTOMER")
            .with_response(PromptKind::ResponseFormatting, "There are 150 customers.")
    }

    fn count_executor() -> ScriptedQueryExecutor {
        ScriptedQueryExecutor::new("Table: CUSTOMER (1 columns)").with_rows(QueryRows::new(
            vec!["COUNT(*)".to_string()],
            vec![vec![json!(150)]],
        ))
    }

    #[test]
    fn run_records_trace_and_returns_messages() {
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let output = orchestrator.run("How many customers are there?", None);
        assert!(output.is_ok(), "{output:?}");
        let output = output.unwrap_or_else(|_| unreachable!());

        assert!(!output.session_id.as_str().is_empty());
        assert_eq!(output.messages, output.state.messages);
        assert_eq!(output.final_answer(), Some("There are 150 customers."));
        assert_eq!(output.generated_sql(), Some("SELECT COUNT(*) FROM CUSTOMER"));
        assert_eq!(output.outcome(), "success");

        let run = traces
            .get_run(output.run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.outcome.as_deref(), Some("success"));
        assert_eq!(run.message_count, 3);
        assert_eq!(run.config_json["max_retries"], json!(3));

        let events = traces
            .list_events_for_run(output.run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(events.len(), 14);
        assert_eq!(events[0].event.event_type, TraceEventType::RunStarted);
        assert_eq!(events[1].event.stage.as_deref(), Some("check_scope"));
        assert_eq!(events[13].event.event_type, TraceEventType::RunFinished);

        let replay = orchestrator
            .replay_audit(output.run_id)
            .unwrap_or_else(|_| unreachable!());
        assert!(replay.chain_valid);
        assert_eq!(replay.events, 14);
    }

    #[test]
    fn caller_session_and_role_are_kept() {
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let run_id = RunId::new();
        let output = orchestrator
            .run_request(RunRequest {
                query: "How many customers are there?".to_string(),
                session_id: Some("Team-Alpha".to_string()),
                caller_role: Some("analyst".to_string()),
                run_id: Some(run_id),
            })
            .unwrap_or_else(|err| panic!("run: {err:#}"));
        assert_eq!(output.run_id, run_id);
        assert_eq!(output.session_id, SessionId::from("Team-Alpha"));

        let run = traces
            .get_run(run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.caller_role.as_deref(), Some("analyst"));
        assert_eq!(
            history
                .recent_interactions(&SessionId::from("Team-Alpha"), 5)
                .unwrap_or_else(|_| unreachable!())
                .len(),
            1
        );
    }

    #[test]
    fn blank_session_id_gets_a_generated_one() {
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let first = orchestrator
            .run("How many customers are there?", Some("   "))
            .unwrap_or_else(|err| panic!("run: {err:#}"));
        let second = orchestrator
            .run("How many customers are there?", None)
            .unwrap_or_else(|err| panic!("run: {err:#}"));
        assert_ne!(first.session_id.as_str().trim(), "");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.messages, second.messages);
    }

    #[test]
    fn business_outcomes_complete_the_run() {
        let llm = ScriptedLanguageModel::new().with_response(PromptKind::ScopeCheck, "no");
        let executor = ScriptedQueryExecutor::new("");
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let output = orchestrator
            .run("Tell me a joke", Some("s"))
            .unwrap_or_else(|err| panic!("run: {err:#}"));
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.generated_sql(), None);

        let events = traces
            .list_events_for_run(output.run_id)
            .unwrap_or_else(|_| unreachable!());
        let skipped = events
            .iter()
            .filter(|row| row.event.event_type == TraceEventType::StageSkipped)
            .count();
        assert_eq!(skipped, 4);
        let run = traces
            .get_run(output.run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.outcome.as_deref(), Some("out_of_scope"));
    }

    #[test]
    fn collaborator_failure_faults_the_run() {
        let llm = ScriptedLanguageModel::new().with_response(PromptKind::ScopeCheck, "yes");
        let executor = ScriptedQueryExecutor::new("");
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let run_id = RunId::new();
        let result = orchestrator.run_request(RunRequest {
            run_id: Some(run_id),
            ..RunRequest::new("How many orders?")
        });
        assert!(result.is_err());

        let run = traces
            .get_run(run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Faulted);
        let events = traces
            .list_events_for_run(run_id)
            .unwrap_or_else(|_| unreachable!());
        let last = events.last().unwrap_or_else(|| unreachable!());
        assert_eq!(last.event.event_type, TraceEventType::Error);
        assert_eq!(last.event.stage.as_deref(), Some("analyze_query"));
        assert!(orchestrator
            .replay_audit(run_id)
            .unwrap_or_else(|_| unreachable!())
            .chain_valid);
    }

    #[test]
    fn empty_query_is_rejected_before_any_trace() {
        let llm = MockLanguageModel::new();
        let executor = ScriptedQueryExecutor::new("");
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );
        assert!(orchestrator.run("   ", None).is_err());
        assert!(traces.list_runs().unwrap_or_else(|_| unreachable!()).is_empty());
    }

    #[test]
    fn replay_detects_broken_links_and_tampered_payloads() {
        let llm = MockLanguageModel::new();
        let executor = ScriptedQueryExecutor::new("");
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = InMemoryTraceStore::new();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let run_id = RunId::new();
        assert!(traces
            .insert_run(&RunRecord {
                run_id,
                session_id: SessionId::from("s"),
                query: "q".to_string(),
                caller_role: None,
                started_at: now_utc(),
                ended_at: None,
                status: RunStatus::Running,
                outcome: None,
                message_count: 0,
                engine_version: "test".to_string(),
                config_json: json!({}),
            })
            .is_ok());

        let payload = json!({"k": "v"});
        let mut event = TraceEvent {
            event_id: ulid::Ulid::new(),
            run_id,
            event_type: TraceEventType::RunStarted,
            stage: None,
            occurred_at: now_utc(),
            payload_hash: hash_json(&payload).unwrap_or_else(|_| unreachable!()),
            payload_json: json!({"k": "tampered"}),
            prev_event_hash: None,
            event_hash: String::new(),
        };
        event.event_hash = event_hash(&event).unwrap_or_else(|_| unreachable!());
        assert!(traces.append_event(&event).is_ok());

        let replay = orchestrator
            .replay_audit(run_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(replay.events, 1);
        assert!(!replay.chain_valid);
    }

    #[test]
    fn sqlite_history_pairs_with_in_memory_trace() {
        let history =
            SqliteStore::open_in_memory().unwrap_or_else(|err| panic!("store: {err:#}"));
        let traces = InMemoryTraceStore::new();
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let output = orchestrator.run("How many customers are there?", Some("s"));
        assert!(output.is_ok(), "{output:?}");
        let output = output.unwrap_or_else(|_| unreachable!());
        assert_eq!(output.outcome(), "success");
        assert_eq!(
            history
                .recent_interactions(&SessionId::from("s"), 5)
                .unwrap_or_else(|_| unreachable!())
                .len(),
            1
        );
    }

    #[test]
    fn trace_write_failure_after_stages_faults_the_run() {
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let history = InMemoryHistoryStore::new();
        let traces = RejectingTraceStore {
            inner: InMemoryTraceStore::new(),
            reject: TraceEventType::RunFinished,
        };
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &history,
            &traces,
            AgentConfig::default(),
        );

        let run_id = RunId::new();
        let result = orchestrator.run_request(RunRequest {
            run_id: Some(run_id),
            ..RunRequest::new("How many customers are there?")
        });
        assert!(result.is_err());

        let run = traces
            .get_run(run_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Faulted);
        assert_eq!(run.outcome.as_deref(), Some("success"));

        let events = traces
            .list_events_for_run(run_id)
            .unwrap_or_else(|_| unreachable!());
        let last = events.last().unwrap_or_else(|| unreachable!());
        assert_eq!(last.event.event_type, TraceEventType::Error);
        assert_eq!(last.event.stage, None);
        assert!(orchestrator
            .replay_audit(run_id)
            .unwrap_or_else(|_| unreachable!())
            .chain_valid);
    }

    #[test]
    fn concurrent_runs_share_one_session_history() {
        let store = SqliteStore::open_in_memory().unwrap_or_else(|err| panic!("store: {err:#}"));
        assert!(store.migrate().is_ok());
        let llm = count_model();
        let executor = count_executor();
        let guard = validator();
        let orchestrator = SessionOrchestrator::new(
            &llm,
            &executor,
            &guard,
            &store,
            &store,
            AgentConfig::default(),
        );

        let run_ids: Vec<RunId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        orchestrator
                            .run("How many customers are there?", Some("shared"))
                            .map(|output| output.run_id)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| panic!("worker panicked"))
                        .unwrap_or_else(|err| panic!("run: {err:#}"))
                })
                .collect()
        });

        let recorded = store
            .recent_interactions(&SessionId::from("shared"), 10)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(recorded.len(), 4);
        for run_id in run_ids {
            let replay = orchestrator
                .replay_audit(run_id)
                .unwrap_or_else(|_| unreachable!());
            assert!(replay.chain_valid);
            assert_eq!(replay.events, 14);
        }
    }
}
