#![forbid(unsafe_code)]
//! Prompt texts sent to the language model.
//!
//! Downstream parsing depends on the answer shape each prompt instructs:
//! `yes`/`no` for scope, `SUMMARY_QUESTION`/`NEW_QUERY` for question type,
//! and bare SQL (optionally fenced) for generation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    ScopeCheck,
    QuestionType,
    SqlGeneration,
    SummaryResponse,
    ResponseFormatting,
}

impl PromptKind {
    pub const ALL: [Self; 5] = [
        Self::ScopeCheck,
        Self::QuestionType,
        Self::SqlGeneration,
        Self::SummaryResponse,
        Self::ResponseFormatting,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScopeCheck => "scope_check",
            Self::QuestionType => "question_type",
            Self::SqlGeneration => "sql_generation",
            Self::SummaryResponse => "summary_response",
            Self::ResponseFormatting => "response_formatting",
        }
    }
}

#[must_use]
pub fn scope_check_prompt(query: &str) -> String {
    format!(
        "Determine if this question is related to querying, analyzing, or understanding data in a database.

Question: {query}

Answer with ONLY 'yes' or 'no':
- 'yes' if the question is about data, database queries, statistics, or information that could be in a database
- 'no' if it's about unrelated topics like weather, jokes, general knowledge, code generation, etc.

Answer:"
    )
}

#[must_use]
pub fn question_type_prompt(query: &str) -> String {
    format!(
        "Is this question asking for a SUMMARY or REFERENCE to previous conversation?

User query: {query}

Answer with ONLY 'SUMMARY_QUESTION' or 'NEW_QUERY':
- SUMMARY_QUESTION: if user wants to summarize, reference, or review previous discussion
  Examples: \"summarize what we discussed\", \"what was the count?\", \"tell me about those results\", \"remind me...\"
- NEW_QUERY: if user is asking a new question about the database
"
    )
}

#[must_use]
pub fn sql_generation_prompt(query: &str, schema_info: &str, history_context: &str) -> String {
    format!(
        "Given the following database schema:
{schema_info}

{history_context}

User query: {query}

Instructions:
- If the user is asking about previous results or wants a summary of what was discussed, you can reference the conversation history above
- If the user needs new data from the database, generate a SQL query
- Use conversation history to understand references like \"those orders\", \"them\", \"the previous table\", etc.
- Return ONLY the SQL query, nothing else

Generate a SQL query to answer this question:
"
    )
}

#[must_use]
pub fn summary_response_prompt(query: &str, history_data: &str) -> String {
    format!(
        "The user asked: {query}

Here is the conversation history:
{history_data}

Based on the conversation history above, provide a comprehensive summary answering the user's question.
"
    )
}

#[must_use]
pub fn response_formatting_prompt(query: &str, sql_result: &str) -> String {
    format!(
        "User asked: {query}

SQL Results: {sql_result}

Provide a clear, natural language answer to the user's question based on these results.
"
    )
}

/// `true` when a scope-check answer is an affirmative `yes`.
#[must_use]
pub fn parse_scope_answer(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// `true` when a question-type answer names `SUMMARY_QUESTION`; anything else is a new query.
#[must_use]
pub fn parse_summary_answer(answer: &str) -> bool {
    answer.trim().to_uppercase().contains("SUMMARY_QUESTION")
}

/// Strip a fenced code block wrapper (and its language tag) from a model answer.
#[must_use]
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.split_once('\n') {
        Some((_language_tag, body)) => body,
        None => rest,
    };
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}
