#![forbid(unsafe_code)]
//! The six-stage question answering pipeline.
//!
//! Stages always run in [`Stage::ALL`] order. A stage that has nothing to do
//! for the current [`Outcome`] reports itself as skipped and leaves the state
//! untouched, so branching lives entirely in the outcome variant.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sql_agent_domain::{
    truncate_chars, AgentConfig, Message, NewInteraction, SessionId, NO_HISTORY_ERROR_ACTION,
    SUMMARY_REQUEST_SQL,
};
use sql_agent_prompts::{
    parse_scope_answer, parse_summary_answer, question_type_prompt, response_formatting_prompt,
    scope_check_prompt, sql_generation_prompt, strip_code_fence, summary_response_prompt,
    PromptKind,
};
use sql_agent_provider::{CompletionRequest, LanguageModel};
use sql_agent_safety::SqlGuard;
use sql_agent_store_core::{HistoryStore, NO_HISTORY_SENTINEL};
use sql_agent_warehouse::{QueryExecutor, QueryOutcome, QueryRows};

pub const OUT_OF_SCOPE_MESSAGE: &str = "I'm a SQL agent designed to answer questions about your database. Your question doesn't appear to be data-related.";

pub const NO_HISTORY_GUIDANCE: &str = "No previous queries in this session to summarize. Please ask a new question about the database, or start a fresh query.";

pub const USING_HISTORY_MESSAGE: &str = "Using conversation history to answer...";

pub const SAFETY_PASSED_MESSAGE: &str = "Safety validation passed";

pub const LARGE_RESULT_MESSAGE: &str = "Large result set detected - showing first 10 rows";

pub const SUMMARY_RESULT_TEXT: &str = "Used conversation history";

/// Where a run currently stands. Every stage dispatches on this.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    OutOfScope,
    NoHistory { guidance: String },
    SummaryRequest { history: String },
    SqlGenerated { sql: String },
    Blocked { sql: String, reason: String },
    ExecutionError { sql: String, error: String },
    Success { sql: String, rows: QueryRows },
}

impl Outcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OutOfScope => "out_of_scope",
            Self::NoHistory { .. } => "no_history",
            Self::SummaryRequest { .. } => "summary_request",
            Self::SqlGenerated { .. } => "sql_generated",
            Self::Blocked { .. } => "blocked",
            Self::ExecutionError { .. } => "execution_error",
            Self::Success { .. } => "success",
        }
    }

    /// The generated statement, once there is one.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::SqlGenerated { sql }
            | Self::Blocked { sql, .. }
            | Self::ExecutionError { sql, .. }
            | Self::Success { sql, .. } => Some(sql.as_str()),
            Self::Pending
            | Self::OutOfScope
            | Self::NoHistory { .. }
            | Self::SummaryRequest { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowState {
    pub session_id: SessionId,
    pub query: String,
    pub messages: Vec<Message>,
    pub outcome: Outcome,
    pub retry_count: u32,
    pub is_in_scope: bool,
}

impl WorkflowState {
    #[must_use]
    pub fn new(session_id: SessionId, query: impl Into<String>) -> Self {
        Self {
            session_id,
            query: query.into(),
            messages: Vec::new(),
            outcome: Outcome::Pending,
            retry_count: 0,
            is_in_scope: true,
        }
    }

    /// Legacy text form of the result slot.
    #[must_use]
    pub fn sql_result(&self) -> String {
        match &self.outcome {
            Outcome::Pending | Outcome::SqlGenerated { .. } => String::new(),
            Outcome::OutOfScope => "OUT_OF_SCOPE".to_string(),
            Outcome::NoHistory { guidance } => guidance.clone(),
            Outcome::SummaryRequest { history } => format!("SUMMARY:{history}"),
            Outcome::Blocked { reason, .. } => format!("BLOCKED: {reason}"),
            Outcome::ExecutionError { error, .. } => {
                QueryOutcome::failed(error.as_str()).render()
            }
            Outcome::Success { rows, .. } => rows.render(),
        }
    }

    /// Legacy text form of the next-action slot.
    #[must_use]
    pub fn next_action(&self) -> String {
        match &self.outcome {
            Outcome::NoHistory { .. } => NO_HISTORY_ERROR_ACTION.to_string(),
            Outcome::SummaryRequest { .. } => SUMMARY_REQUEST_SQL.to_string(),
            other => other.sql().unwrap_or_default().to_string(),
        }
    }

    fn say(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CheckScope,
    AnalyzeQuery,
    ValidateSql,
    ExecuteSql,
    FormatResults,
    Respond,
}

impl Stage {
    pub const ALL: [Self; 6] = [
        Self::CheckScope,
        Self::AnalyzeQuery,
        Self::ValidateSql,
        Self::ExecuteSql,
        Self::FormatResults,
        Self::Respond,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckScope => "check_scope",
            Self::AnalyzeQuery => "analyze_query",
            Self::ValidateSql => "validate_sql",
            Self::ExecuteSql => "execute_sql",
            Self::FormatResults => "format_results",
            Self::Respond => "respond",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageDisposition {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub disposition: StageDisposition,
    pub detail: Value,
}

impl StageReport {
    fn ran(stage: Stage, detail: Value) -> Self {
        Self {
            stage,
            disposition: StageDisposition::Ran,
            detail,
        }
    }

    fn skipped(stage: Stage, outcome: &Outcome) -> Self {
        Self {
            stage,
            disposition: StageDisposition::Skipped,
            detail: json!({ "outcome": outcome.label() }),
        }
    }
}

/// Drives one [`WorkflowState`] through the stages against injected collaborators.
pub struct WorkflowEngine<'a> {
    llm: &'a dyn LanguageModel,
    executor: &'a dyn QueryExecutor,
    guard: &'a dyn SqlGuard,
    history: &'a dyn HistoryStore,
    config: AgentConfig,
}

impl<'a> WorkflowEngine<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LanguageModel,
        executor: &'a dyn QueryExecutor,
        guard: &'a dyn SqlGuard,
        history: &'a dyn HistoryStore,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            guard,
            history,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run every stage in order.
    ///
    /// # Errors
    /// Returns the first collaborator failure; the state keeps whatever the
    /// earlier stages wrote.
    pub fn run_all(&self, state: &mut WorkflowState) -> Result<Vec<StageReport>> {
        Stage::ALL
            .iter()
            .map(|stage| self.run_stage(*stage, state))
            .collect()
    }

    /// Run a single stage.
    ///
    /// # Errors
    /// Returns an error when the language model, query executor, or history
    /// store fails outright. Business outcomes are never errors.
    pub fn run_stage(&self, stage: Stage, state: &mut WorkflowState) -> Result<StageReport> {
        let report = match stage {
            Stage::CheckScope => self.check_scope(state),
            Stage::AnalyzeQuery => self.analyze_query(state),
            Stage::ValidateSql => Ok(self.validate_sql(state)),
            Stage::ExecuteSql => self.execute_sql(state),
            Stage::FormatResults => Ok(format_results(state)),
            Stage::Respond => self.respond(state),
        }
        .with_context(|| format!("stage {} failed", stage.as_str()))?;

        tracing::debug!(
            stage = stage.as_str(),
            disposition = ?report.disposition,
            outcome = state.outcome.label(),
            "stage complete"
        );
        Ok(report)
    }

    fn ask(&self, kind: PromptKind, prompt: String) -> Result<String> {
        tracing::debug!(
            model = self.llm.name(),
            prompt_kind = kind.as_str(),
            "requesting completion"
        );
        self.llm
            .complete(&CompletionRequest::new(kind, prompt))
            .with_context(|| format!("language model {} failed", kind.as_str()))
    }

    fn check_scope(&self, state: &mut WorkflowState) -> Result<StageReport> {
        let answer = self.ask(PromptKind::ScopeCheck, scope_check_prompt(&state.query))?;
        let in_scope = parse_scope_answer(&answer);
        state.is_in_scope = in_scope;
        if !in_scope {
            tracing::info!(session_id = %state.session_id, "query rejected as out of scope");
            state.outcome = Outcome::OutOfScope;
            state.say(OUT_OF_SCOPE_MESSAGE);
        }
        Ok(StageReport::ran(
            Stage::CheckScope,
            json!({ "in_scope": in_scope }),
        ))
    }

    fn analyze_query(&self, state: &mut WorkflowState) -> Result<StageReport> {
        if !state.is_in_scope {
            return Ok(StageReport::skipped(Stage::AnalyzeQuery, &state.outcome));
        }

        let history_context = self
            .history
            .format_history_for_context(&state.session_id, self.config.history_limit)?;
        let has_history = !history_context.contains(NO_HISTORY_SENTINEL);

        let answer = self.ask(PromptKind::QuestionType, question_type_prompt(&state.query))?;
        let is_summary = parse_summary_answer(&answer);

        if is_summary && !has_history {
            state.outcome = Outcome::NoHistory {
                guidance: NO_HISTORY_GUIDANCE.to_string(),
            };
            state.say(NO_HISTORY_GUIDANCE);
        } else if is_summary {
            state.outcome = Outcome::SummaryRequest {
                history: history_context,
            };
            state.say(USING_HISTORY_MESSAGE);
        } else {
            let schema_info = self.executor.schema_info(true)?;
            let raw = self.ask(
                PromptKind::SqlGeneration,
                sql_generation_prompt(&state.query, &schema_info, &history_context),
            )?;
            let sql = strip_code_fence(&raw);
            tracing::info!(session_id = %state.session_id, sql = %sql, "generated sql");
            state.say(format!("Generated SQL: {sql}"));
            state.outcome = Outcome::SqlGenerated { sql };
        }

        Ok(StageReport::ran(
            Stage::AnalyzeQuery,
            json!({
                "question_type": if is_summary { "summary_question" } else { "new_query" },
                "has_history": has_history,
                "outcome": state.outcome.label(),
                "sql": state.outcome.sql(),
            }),
        ))
    }

    fn validate_sql(&self, state: &mut WorkflowState) -> StageReport {
        let Outcome::SqlGenerated { sql } = &state.outcome else {
            return StageReport::skipped(Stage::ValidateSql, &state.outcome);
        };
        let sql = sql.clone();

        let validation = self.guard.validate(&sql);
        let detail = json!({
            "is_valid": validation.is_valid,
            "violations": validation.violations,
        });
        if validation.is_valid {
            state.say(SAFETY_PASSED_MESSAGE);
        } else {
            tracing::warn!(
                session_id = %state.session_id,
                violations = ?validation.violations,
                "generated sql blocked"
            );
            let report = self.guard.violation_report(&sql);
            state.say(format!("Safety Check Failed:\n{report}"));
            state.outcome = Outcome::Blocked {
                sql,
                reason: validation.message,
            };
        }
        StageReport::ran(Stage::ValidateSql, detail)
    }

    fn execute_sql(&self, state: &mut WorkflowState) -> Result<StageReport> {
        let Outcome::SqlGenerated { sql } = &state.outcome else {
            return Ok(StageReport::skipped(Stage::ExecuteSql, &state.outcome));
        };
        let sql = sql.clone();

        let mut attempts = 1_u32;
        let mut result = self.executor.execute(&sql)?;

        // A failed statement gets exactly one more attempt per run.
        if !result.is_success() && state.retry_count < self.config.max_retries {
            let previous = state.retry_count;
            state.retry_count = previous + 1;
            let remaining = self
                .config
                .max_retries
                .saturating_sub(previous)
                .saturating_sub(1);
            tracing::warn!(
                session_id = %state.session_id,
                attempt = previous + 1,
                "query execution failed, retrying"
            );
            state.say(format!(
                "Attempt {} failed, retrying... ({remaining} retries left)",
                previous + 1
            ));
            attempts += 1;
            result = self.executor.execute(&sql)?;
        }

        let detail = json!({
            "attempts": attempts,
            "retry_count": state.retry_count,
            "success": result.is_success(),
        });
        match result {
            QueryOutcome::Rows(rows) => {
                state.outcome = Outcome::Success { sql, rows };
            }
            QueryOutcome::Failed { message } => {
                let failure = QueryOutcome::failed(message.as_str()).render();
                state.say(failure);
                state.outcome = Outcome::ExecutionError {
                    sql,
                    error: message,
                };
            }
        }
        Ok(StageReport::ran(Stage::ExecuteSql, detail))
    }

    fn respond(&self, state: &mut WorkflowState) -> Result<StageReport> {
        match &state.outcome {
            Outcome::SummaryRequest { history } => {
                let answer = self.ask(
                    PromptKind::SummaryResponse,
                    summary_response_prompt(&state.query, history),
                )?;
                state.say(answer);
                self.history.add_interaction(&NewInteraction {
                    session_id: state.session_id.clone(),
                    user_query: state.query.clone(),
                    generated_sql: SUMMARY_REQUEST_SQL.to_string(),
                    result_summary: SUMMARY_RESULT_TEXT.to_string(),
                    is_successful: true,
                })?;
                Ok(StageReport::ran(
                    Stage::Respond,
                    json!({ "answered": "summary", "recorded": true }),
                ))
            }
            Outcome::Success { sql, rows } => {
                let sql = sql.clone();
                let rendered = rows.render();
                let answer = self.ask(
                    PromptKind::ResponseFormatting,
                    response_formatting_prompt(&state.query, &rendered),
                )?;
                state.say(answer);
                self.history.add_interaction(&NewInteraction {
                    session_id: state.session_id.clone(),
                    user_query: state.query.clone(),
                    generated_sql: sql,
                    result_summary: truncate_chars(&rendered, self.config.result_summary_chars),
                    is_successful: true,
                })?;
                Ok(StageReport::ran(
                    Stage::Respond,
                    json!({ "answered": "query_result", "recorded": true }),
                ))
            }
            Outcome::SqlGenerated { .. } | Outcome::Pending => Err(anyhow!(
                "respond reached with unresolved outcome {}",
                state.outcome.label()
            )),
            Outcome::OutOfScope
            | Outcome::NoHistory { .. }
            | Outcome::Blocked { .. }
            | Outcome::ExecutionError { .. } => Ok(StageReport::ran(
                Stage::Respond,
                json!({ "answered": "already_explained", "recorded": false }),
            )),
        }
    }
}

fn format_results(state: &mut WorkflowState) -> StageReport {
    let Outcome::Success { rows, .. } = &state.outcome else {
        return StageReport::skipped(Stage::FormatResults, &state.outcome);
    };
    let truncated = rows.is_truncated();
    let detail = json!({
        "truncated": truncated,
        "total_rows": rows.total_rows,
        "shown_rows": rows.rows.len(),
    });
    if truncated {
        state.say(LARGE_RESULT_MESSAGE);
    }
    StageReport::ran(Stage::FormatResults, detail)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{
        Outcome, Stage, StageDisposition, WorkflowEngine, WorkflowState, LARGE_RESULT_MESSAGE,
        NO_HISTORY_GUIDANCE, OUT_OF_SCOPE_MESSAGE, SAFETY_PASSED_MESSAGE, USING_HISTORY_MESSAGE,
    };
    use serde_json::json;
    use sql_agent_domain::{
        AgentConfig, Message, NewInteraction, SessionId, ValidationOutcome,
        NO_HISTORY_ERROR_ACTION, SUMMARY_REQUEST_SQL,
    };
    use sql_agent_prompts::PromptKind;
    use sql_agent_provider::ScriptedLanguageModel;
    use sql_agent_safety::{SafetyValidator, SqlGuard};
    use sql_agent_store_core::{HistoryStore, InMemoryHistoryStore};
    use sql_agent_warehouse::{QueryRows, ScriptedQueryExecutor};

    struct CountingGuard {
        inner: SafetyValidator,
        validations: AtomicUsize,
    }

    impl CountingGuard {
        fn new() -> Self {
            Self {
                inner: SafetyValidator::new().unwrap_or_else(|err| panic!("validator: {err}")),
                validations: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.validations.load(Ordering::SeqCst)
        }
    }

    impl SqlGuard for CountingGuard {
        fn validate(&self, sql: &str) -> ValidationOutcome {
            self.validations.fetch_add(1, Ordering::SeqCst);
            self.inner.validate(sql)
        }

        fn violation_report(&self, sql: &str) -> String {
            self.inner.violation_report(sql)
        }
    }

    fn new_query_model(sql: &str, answer: &str) -> ScriptedLanguageModel {
        ScriptedLanguageModel::new()
            .with_response(PromptKind::ScopeCheck, "yes")
            .with_response(PromptKind::QuestionType, "NEW_QUERY")
            .with_response(PromptKind::SqlGeneration, sql)
            .with_response(PromptKind::ResponseFormatting, answer)
    }

    fn count_rows(count: i64) -> QueryRows {
        QueryRows::new(vec!["COUNT(*)".to_string()], vec![vec![json!(count)]])
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.content.as_str()).collect()
    }

    fn run(
        llm: &ScriptedLanguageModel,
        executor: &ScriptedQueryExecutor,
        guard: &CountingGuard,
        history: &InMemoryHistoryStore,
        session: &str,
        query: &str,
    ) -> WorkflowState {
        let engine = WorkflowEngine::new(llm, executor, guard, history, AgentConfig::default());
        let mut state = WorkflowState::new(SessionId::from(session), query);
        let reports = engine.run_all(&mut state);
        assert!(reports.is_ok(), "{reports:?}");
        state
    }

    #[test]
    fn count_question_produces_sql_safety_and_answer() {
        let llm = new_query_model("SELECT COUNT(*) FROM CUSTOMER", "There are 150 customers.");
        let executor = ScriptedQueryExecutor::new("Table: CUSTOMER (1 columns)")
            .with_rows(count_rows(150));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(
            &llm,
            &executor,
            &guard,
            &history,
            "s1",
            "How many customers are there?",
        );

        assert_eq!(
            contents(&state.messages),
            vec![
                "Generated SQL: SELECT COUNT(*) FROM CUSTOMER",
                SAFETY_PASSED_MESSAGE,
                "There are 150 customers.",
            ]
        );
        assert_eq!(state.sql_result(), "Results (1 rows):\n[{'COUNT(*)': 150}]");
        assert_eq!(state.next_action(), "SELECT COUNT(*) FROM CUSTOMER");
        assert_eq!(executor.execute_calls(), 1);
        assert_eq!(guard.calls(), 1);

        let formatting_prompt = llm
            .calls()
            .into_iter()
            .find(|call| call.kind == PromptKind::ResponseFormatting)
            .unwrap_or_else(|| unreachable!());
        assert!(formatting_prompt
            .prompt
            .contains("SQL Results: Results (1 rows):\n[{'COUNT(*)': 150}]"));

        let recorded = history
            .recent_interactions(&SessionId::from("s1"), 5)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].generated_sql, "SELECT COUNT(*) FROM CUSTOMER");
        assert!(recorded[0].is_successful);
    }

    #[test]
    fn out_of_scope_question_never_touches_sql_collaborators() {
        let llm = ScriptedLanguageModel::new().with_response(PromptKind::ScopeCheck, "no");
        let executor = ScriptedQueryExecutor::new("");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "s1", "Tell me a joke");

        assert_eq!(contents(&state.messages), vec![OUT_OF_SCOPE_MESSAGE]);
        assert_eq!(state.outcome, Outcome::OutOfScope);
        assert_eq!(state.sql_result(), "OUT_OF_SCOPE");
        assert!(!state.is_in_scope);
        assert_eq!(executor.execute_calls(), 0);
        assert_eq!(executor.schema_calls(), 0);
        assert_eq!(guard.calls(), 0);
        assert_eq!(llm.calls().len(), 1);
        assert!(history
            .list_sessions()
            .unwrap_or_else(|_| unreachable!())
            .is_empty());
    }

    #[test]
    fn destructive_sql_is_blocked_before_execution() {
        let llm = new_query_model("DROP TABLE CUSTOMER", "unused");
        let executor = ScriptedQueryExecutor::new("").with_rows(count_rows(1));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "s1", "Remove the customers");

        assert!(state.sql_result().starts_with("BLOCKED:"));
        assert!(matches!(state.outcome, Outcome::Blocked { ref sql, .. } if sql == "DROP TABLE CUSTOMER"));
        assert_eq!(executor.execute_calls(), 0);
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages[1]
            .content
            .starts_with("Safety Check Failed:\n===="));
        assert!(state.messages[1].content.contains("  1. DROP"));
        assert_eq!(llm.calls_for(PromptKind::ResponseFormatting), 0);
        assert!(history
            .recent_interactions(&SessionId::from("s1"), 5)
            .unwrap_or_else(|_| unreachable!())
            .is_empty());
    }

    #[test]
    fn persistent_execution_failure_retries_exactly_once() {
        let llm = new_query_model("SELECT * FROM CUSTOMER", "unused");
        let executor = ScriptedQueryExecutor::new("")
            .with_failure("warehouse timeout")
            .with_failure("warehouse timeout");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "s1", "List customers");

        assert_eq!(executor.execute_calls(), 2);
        assert_eq!(state.retry_count, 1);
        assert_eq!(
            state.sql_result(),
            "Error executing query: warehouse timeout"
        );
        assert_eq!(
            contents(&state.messages),
            vec![
                "Generated SQL: SELECT * FROM CUSTOMER",
                SAFETY_PASSED_MESSAGE,
                "Attempt 1 failed, retrying... (2 retries left)",
                "Error executing query: warehouse timeout",
            ]
        );
        assert_eq!(llm.calls_for(PromptKind::ResponseFormatting), 0);
        assert!(history
            .recent_interactions(&SessionId::from("s1"), 5)
            .unwrap_or_else(|_| unreachable!())
            .is_empty());
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let llm = new_query_model("SELECT COUNT(*) FROM CUSTOMER", "150 customers.");
        let executor = ScriptedQueryExecutor::new("")
            .with_failure("connection reset")
            .with_rows(count_rows(150));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "s1", "How many customers?");

        assert_eq!(executor.execute_calls(), 2);
        assert_eq!(state.outcome.label(), "success");
        assert_eq!(state.messages.last().map(|m| m.content.as_str()), Some("150 customers."));
    }

    #[test]
    fn exhausted_retry_budget_stops_retrying() {
        let llm = new_query_model("SELECT 1", "unused");
        let executor = ScriptedQueryExecutor::new("").with_failure("boom");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();
        let engine = WorkflowEngine::new(&llm, &executor, &guard, &history, AgentConfig::default());

        let mut state = WorkflowState::new(SessionId::from("s"), "q");
        state.retry_count = 3;
        for stage in [Stage::CheckScope, Stage::AnalyzeQuery, Stage::ValidateSql, Stage::ExecuteSql] {
            assert!(engine.run_stage(stage, &mut state).is_ok());
        }
        assert_eq!(executor.execute_calls(), 1);
        assert_eq!(state.retry_count, 3);
    }

    #[test]
    fn summary_without_history_returns_guidance_only() {
        let llm = ScriptedLanguageModel::new()
            .with_response(PromptKind::ScopeCheck, "yes")
            .with_response(PromptKind::QuestionType, "SUMMARY_QUESTION");
        let executor = ScriptedQueryExecutor::new("");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "fresh", "Summarize what we discussed");

        assert_eq!(state.next_action(), NO_HISTORY_ERROR_ACTION);
        assert_eq!(state.sql_result(), NO_HISTORY_GUIDANCE);
        assert_eq!(contents(&state.messages), vec![NO_HISTORY_GUIDANCE]);
        assert_eq!(executor.execute_calls(), 0);
        assert_eq!(executor.schema_calls(), 0);
        assert_eq!(guard.calls(), 0);
        assert_eq!(llm.calls_for(PromptKind::SummaryResponse), 0);
        assert_eq!(llm.calls_for(PromptKind::ResponseFormatting), 0);
        assert!(history
            .list_sessions()
            .unwrap_or_else(|_| unreachable!())
            .is_empty());
    }

    #[test]
    fn summary_with_history_answers_from_transcript() {
        let llm = ScriptedLanguageModel::new()
            .with_response(PromptKind::ScopeCheck, "yes")
            .with_response(PromptKind::QuestionType, "summary_question")
            .with_response(PromptKind::SummaryResponse, "You asked how many customers exist: 150.");
        let executor = ScriptedQueryExecutor::new("");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();
        assert!(history
            .add_interaction(&NewInteraction {
                session_id: SessionId::from("s1"),
                user_query: "How many customers are there?".to_string(),
                generated_sql: "SELECT COUNT(*) FROM CUSTOMER".to_string(),
                result_summary: "Results (1 rows):\n[{'COUNT(*)': 150}]".to_string(),
                is_successful: true,
            })
            .is_ok());

        let state = run(&llm, &executor, &guard, &history, "s1", "Remind me what we found");

        assert_eq!(
            contents(&state.messages),
            vec![USING_HISTORY_MESSAGE, "You asked how many customers exist: 150."]
        );
        assert_eq!(state.next_action(), SUMMARY_REQUEST_SQL);
        assert!(state.sql_result().starts_with("SUMMARY:Previous conversation history"));
        assert_eq!(executor.execute_calls(), 0);

        let summary_prompt = llm
            .calls()
            .into_iter()
            .find(|call| call.kind == PromptKind::SummaryResponse)
            .unwrap_or_else(|| unreachable!());
        assert!(summary_prompt.prompt.contains("1. User asked: How many customers are there?"));

        let recorded = history
            .recent_interactions(&SessionId::from("s1"), 5)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].generated_sql, SUMMARY_REQUEST_SQL);
        assert_eq!(recorded[1].result_summary, "Used conversation history");
    }

    #[test]
    fn identical_runs_on_fresh_sessions_emit_identical_messages() {
        let llm = new_query_model("SELECT COUNT(*) FROM CUSTOMER", "There are 150 customers.");
        let executor = ScriptedQueryExecutor::new("Table: CUSTOMER (1 columns)")
            .with_rows(count_rows(150));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let first = run(&llm, &executor, &guard, &history, "a", "How many customers are there?");
        let second = run(&llm, &executor, &guard, &history, "b", "How many customers are there?");
        assert_eq!(first.messages, second.messages);
    }

    #[test]
    fn fenced_sql_is_unwrapped_and_history_reaches_the_prompt() {
        let llm = new_query_model("```sql\nSELECT NAME FROM CUSTOMER\n```", "Names listed.");
        let executor = ScriptedQueryExecutor::new("Table: CUSTOMER (1 columns)")
            .with_rows(QueryRows::new(vec!["NAME".to_string()], vec![vec![json!("Ann")]]));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();
        assert!(history
            .add_interaction(&NewInteraction {
                session_id: SessionId::from("s1"),
                user_query: "earlier".to_string(),
                generated_sql: "SELECT 1".to_string(),
                result_summary: "r".to_string(),
                is_successful: true,
            })
            .is_ok());

        let state = run(&llm, &executor, &guard, &history, "s1", "Who are they?");
        assert_eq!(state.messages[0].content, "Generated SQL: SELECT NAME FROM CUSTOMER");

        let generation = llm
            .calls()
            .into_iter()
            .find(|call| call.kind == PromptKind::SqlGeneration)
            .unwrap_or_else(|| unreachable!());
        assert!(generation.prompt.contains("Table: CUSTOMER (1 columns)"));
        assert!(generation.prompt.contains("1. User asked: earlier"));
        assert_eq!(executor.schema_calls(), 1);
    }

    #[test]
    fn truncated_results_add_large_result_notice_and_bounded_summary() {
        let rows: Vec<Vec<serde_json::Value>> = (0..10)
            .map(|idx| vec![json!("x".repeat(80)), json!(idx)])
            .collect();
        let llm = new_query_model("SELECT * FROM EVENTS", "Lots of events.");
        let executor = ScriptedQueryExecutor::new("").with_rows(QueryRows::truncated(
            vec!["PAYLOAD".to_string(), "ID".to_string()],
            rows,
            42,
        ));
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();

        let state = run(&llm, &executor, &guard, &history, "s1", "Show events");
        assert_eq!(
            contents(&state.messages),
            vec![
                "Generated SQL: SELECT * FROM EVENTS",
                SAFETY_PASSED_MESSAGE,
                LARGE_RESULT_MESSAGE,
                "Lots of events.",
            ]
        );

        let recorded = history
            .recent_interactions(&SessionId::from("s1"), 1)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(recorded[0].result_summary.chars().count(), 500);
        assert!(recorded[0]
            .result_summary
            .starts_with("Results (showing 10 of 42 rows):"));
    }

    #[test]
    fn skipped_stages_report_their_disposition() {
        let llm = ScriptedLanguageModel::new().with_response(PromptKind::ScopeCheck, "NO");
        let executor = ScriptedQueryExecutor::new("");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();
        let engine = WorkflowEngine::new(&llm, &executor, &guard, &history, AgentConfig::default());

        let mut state = WorkflowState::new(SessionId::from("s"), "What's the weather?");
        let reports = engine
            .run_all(&mut state)
            .unwrap_or_else(|_| unreachable!());
        let dispositions: Vec<(Stage, StageDisposition)> = reports
            .iter()
            .map(|report| (report.stage, report.disposition))
            .collect();
        assert_eq!(
            dispositions,
            vec![
                (Stage::CheckScope, StageDisposition::Ran),
                (Stage::AnalyzeQuery, StageDisposition::Skipped),
                (Stage::ValidateSql, StageDisposition::Skipped),
                (Stage::ExecuteSql, StageDisposition::Skipped),
                (Stage::FormatResults, StageDisposition::Skipped),
                (Stage::Respond, StageDisposition::Ran),
            ]
        );
    }

    #[test]
    fn collaborator_failure_is_an_error_not_an_outcome() {
        let llm = ScriptedLanguageModel::new().with_response(PromptKind::ScopeCheck, "yes");
        let executor = ScriptedQueryExecutor::new("");
        let guard = CountingGuard::new();
        let history = InMemoryHistoryStore::new();
        let engine = WorkflowEngine::new(&llm, &executor, &guard, &history, AgentConfig::default());

        let mut state = WorkflowState::new(SessionId::from("s"), "How many orders?");
        let result = engine.run_all(&mut state);
        assert!(result.is_err());
        let message = format!("{:#}", result.err().unwrap_or_else(|| unreachable!()));
        assert!(message.contains("stage analyze_query failed"));
        assert_eq!(executor.execute_calls(), 0);
    }
}
