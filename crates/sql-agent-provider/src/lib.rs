#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sql_agent_prompts::PromptKind;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletionRequest {
    pub kind: PromptKind,
    pub prompt: String,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(kind: PromptKind, prompt: String) -> Self {
        Self { kind, prompt }
    }
}

/// Single-turn text completion.
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProviderConfigError {
    #[error("http_json language model requires params.url")]
    MissingUrl,
    #[error("http_json language model only supports POST, got '{0}'")]
    UnsupportedMethod(String),
    #[error("params.{field} is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("missing env var '{0}' required by params.auth_bearer_env")]
    MissingEnv(String),
    #[error("unsupported language model '{0}'; supported models are 'mock' and 'http_json'")]
    UnsupportedModel(String),
}

/// Deterministic offline model. Answers depend only on the prompt kind and text.
#[derive(Debug, Clone, Default)]
pub struct MockLanguageModel;

impl MockLanguageModel {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LanguageModel for MockLanguageModel {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let answer = match request.kind {
            PromptKind::ScopeCheck => "yes".to_string(),
            PromptKind::QuestionType => {
                let query = line_value(&request.prompt, "User query: ").to_lowercase();
                if query.contains("summar") || query.contains("remind") {
                    "SUMMARY_QUESTION".to_string()
                } else {
                    "NEW_QUERY".to_string()
                }
            }
            PromptKind::SqlGeneration => match first_table_name(&request.prompt) {
                Some(table) => format!("SELECT COUNT(*) AS row_count FROM {table}"),
                None => "SELECT 1".to_string(),
            },
            PromptKind::SummaryResponse => {
                let history = section_between(
                    &request.prompt,
                    "Here is the conversation history:\n",
                    "\n\nBased on the conversation history",
                );
                format!("Summary of this session:\n{history}")
            }
            PromptKind::ResponseFormatting => {
                let results = section_between(
                    &request.prompt,
                    "SQL Results: ",
                    "\n\nProvide a clear, natural language answer",
                );
                format!("Answer based on query results: {results}")
            }
        };
        Ok(answer)
    }
}

fn line_value<'a>(prompt: &'a str, prefix: &str) -> &'a str {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .unwrap_or_default()
}

fn first_table_name(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Table: "))
        .and_then(|rest| rest.split_whitespace().next())
}

fn section_between<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let Some(start_at) = prompt.find(start) else {
        return "";
    };
    let rest = &prompt[start_at + start.len()..];
    match rest.find(end) {
        Some(end_at) => &rest[..end_at],
        None => rest,
    }
}

/// Test double answering from per-kind scripts.
///
/// Responses for a kind are consumed in order; the last one keeps repeating.
#[derive(Debug, Default)]
pub struct ScriptedLanguageModel {
    scripts: Mutex<BTreeMap<PromptKind, VecDeque<String>>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLanguageModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(self, kind: PromptKind, response: impl Into<String>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push_back(response.into());
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn calls_for(&self, kind: PromptKind) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| call.kind == kind)
            .count()
    }
}

impl LanguageModel for ScriptedLanguageModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("scripted model call log poisoned"))?
            .push(request.clone());

        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| anyhow!("scripted model scripts poisoned"))?;
        let queue = scripts
            .get_mut(&request.kind)
            .ok_or_else(|| anyhow!("no scripted response for {}", request.kind.as_str()))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| anyhow!("no scripted response for {}", request.kind.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpLanguageModelConfig {
    pub url: String,
    pub model_id: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
    pub response_pointer: String,
    pub temperature: f64,
}

impl HttpLanguageModelConfig {
    /// Build the adapter configuration from a JSON params object.
    ///
    /// # Errors
    /// Returns a [`ProviderConfigError`] when a field is missing or malformed,
    /// or when the bearer token environment variable is unset.
    pub fn from_params(params: &Value) -> Result<Self, ProviderConfigError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ProviderConfigError::MissingUrl)?
            .to_string();

        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();
        if method != "POST" {
            return Err(ProviderConfigError::UnsupportedMethod(method));
        }

        let model_id = params
            .get("model_id")
            .and_then(Value::as_str)
            .unwrap_or("gpt-4")
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| invalid_field("headers", "must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    invalid_field("headers", &format!("value for '{key}' must be a string"))
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = match params.get("auth_bearer_env").and_then(Value::as_str) {
            Some(env_name) => Some(
                std::env::var(env_name)
                    .map_err(|_| ProviderConfigError::MissingEnv(env_name.to_string()))?,
            ),
            None => None,
        };

        let response_pointer = params
            .get("response_pointer")
            .and_then(Value::as_str)
            .unwrap_or("/choices/0/message/content")
            .to_string();
        if !response_pointer.is_empty() && !response_pointer.starts_with('/') {
            return Err(invalid_field(
                "response_pointer",
                "must be a JSON pointer starting with '/'",
            ));
        }

        let temperature = params
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        Ok(Self {
            url,
            model_id,
            timeout_ms,
            headers,
            auth_bearer_token,
            response_pointer,
            temperature,
        })
    }
}

fn invalid_field(field: &str, reason: &str) -> ProviderConfigError {
    ProviderConfigError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Chat-completions style JSON endpoint.
#[derive(Debug, Clone)]
pub struct HttpJsonLanguageModel {
    config: HttpLanguageModelConfig,
    agent: ureq::Agent,
}

impl HttpJsonLanguageModel {
    #[must_use]
    pub fn new(config: HttpLanguageModelConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self { config, agent }
    }

    #[must_use]
    pub fn config(&self) -> &HttpLanguageModelConfig {
        &self.config
    }

    fn outbound_json(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.config.model_id,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": self.config.temperature,
        })
    }
}

impl LanguageModel for HttpJsonLanguageModel {
    fn name(&self) -> &'static str {
        "http_json"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut req = self
            .agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        tracing::debug!(
            prompt_kind = request.kind.as_str(),
            url = %self.config.url,
            "sending completion request"
        );

        let body: Value = match req.send_json(self.outbound_json(request)) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "language model http status {code} for {}: {detail}",
                    request.kind.as_str()
                ));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("language model transport failure: {err}"));
            }
        };

        extract_completion_text(&body, &self.config.response_pointer)
    }
}

/// Pull the completion text out of a response body.
///
/// # Errors
/// Returns an error when the pointer does not resolve to a string.
pub fn extract_completion_text(body: &Value, pointer: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("language model response has no text at '{pointer}'"))
}

/// Construct a language model by adapter name.
///
/// # Errors
/// Returns an error for unknown adapter names or invalid adapter params.
pub fn route_language_model(name: &str, params: &Value) -> Result<Box<dyn LanguageModel>> {
    match name {
        "mock" => Ok(Box::new(MockLanguageModel::new())),
        "http_json" => Ok(Box::new(HttpJsonLanguageModel::new(
            HttpLanguageModelConfig::from_params(params)?,
        ))),
        other => Err(ProviderConfigError::UnsupportedModel(other.to_string()).into()),
    }
}
