#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Sentinel stored as `generated_sql` for interactions answered from history.
pub const SUMMARY_REQUEST_SQL: &str = "SUMMARY_REQUEST";

/// Sentinel rendered as `next_action` when a summary is requested with no history.
pub const NO_HISTORY_ERROR_ACTION: &str = "NO_HISTORY_ERROR";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run identifier from its ULID text form.
    ///
    /// # Errors
    /// Returns an error when the input is not a valid ULID.
    pub fn parse(input: &str) -> Result<Self> {
        Ulid::from_string(input)
            .map(Self)
            .map_err(|err| anyhow!("invalid run_id ULID: {err}"))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque conversation identifier. Caller-supplied ids are kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_ascii_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub message: String,
    pub violations: Vec<String>,
}

impl ValidationOutcome {
    #[must_use]
    pub fn safe() -> Self {
        Self {
            is_valid: true,
            message: "Query is safe to execute".to_string(),
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn blocked(message: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
            violations,
        }
    }
}

/// An interaction as handed to a history store, before it is sequenced.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewInteraction {
    pub session_id: SessionId,
    pub user_query: String,
    pub generated_sql: String,
    pub result_summary: String,
    pub is_successful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InteractionRecord {
    pub interaction_seq: i64,
    pub session_id: SessionId,
    pub user_query: String,
    pub generated_sql: String,
    pub result_summary: String,
    pub is_successful: bool,
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on the recorded retry counter for one run.
    pub max_retries: u32,
    /// Number of recent interactions fed back to the model as context.
    pub history_limit: usize,
    /// Characters of a result rendering kept in the history store.
    pub result_summary_chars: usize,
    pub engine_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            history_limit: 5,
            result_summary_chars: 500,
            engine_version: "sql-agent.v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Faulted,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    RunStarted,
    StageStarted,
    StageSkipped,
    StageFinished,
    RunFinished,
    Error,
}

impl TraceEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StageStarted => "stage_started",
            Self::StageSkipped => "stage_skipped",
            Self::StageFinished => "stage_finished",
            Self::RunFinished => "run_finished",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_started" => Some(Self::RunStarted),
            "stage_started" => Some(Self::StageStarted),
            "stage_skipped" => Some(Self::StageSkipped),
            "stage_finished" => Some(Self::StageFinished),
            "run_finished" => Some(Self::RunFinished),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub event_type: TraceEventType,
    pub stage: Option<String>,
    pub occurred_at: DateTimeUtc,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub query: String,
    pub caller_role: Option<String>,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: RunStatus,
    pub outcome: Option<String>,
    pub message_count: usize,
    pub engine_version: String,
    pub config_json: Value,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Keep at most `max_chars` characters of `value`, never splitting a code point.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}

/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// # Errors
/// Returns an error when the input is not an RFC3339 timestamp.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{value}': {err}"))
}
