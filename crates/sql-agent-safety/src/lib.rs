#![forbid(unsafe_code)]
//! Read-only enforcement for generated SQL.
//!
//! A statement passes only when it names none of the data- or schema-modifying
//! keywords *and* its leading token is one of the read-only statement forms.

use regex::Regex;
use sql_agent_domain::ValidationOutcome;

pub const DANGEROUS_KEYWORDS: [&str; 11] = [
    "DROP", "DELETE", "TRUNCATE", "UPDATE", "INSERT", "MERGE", "ALTER", "CREATE", "REPLACE",
    "GRANT", "REVOKE",
];

const DANGEROUS_PATTERNS: [&str; 11] = [
    r"\bDROP\s+(TABLE|DATABASE|SCHEMA|VIEW|INDEX)",
    r"\bDELETE\s+FROM\b",
    r"\bTRUNCATE\s+TABLE\b",
    r"\bUPDATE\s+\w+\s+SET\b",
    r"\bINSERT\s+INTO\b",
    r"\bMERGE\s+INTO\b",
    r"\bALTER\s+(TABLE|DATABASE|SCHEMA)",
    r"\bCREATE\s+(TABLE|DATABASE|SCHEMA|VIEW|INDEX)",
    r"\bREPLACE\s+INTO\b",
    r"\bGRANT\s+",
    r"\bREVOKE\s+",
];

pub const ALLOWED_LEADING_TOKENS: [&str; 6] =
    ["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

const REPORT_RULE: &str = "============================================================";
const REPORT_QUERY_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("invalid safety pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Static SQL gate consulted before any statement reaches the warehouse.
pub trait SqlGuard: Send + Sync {
    fn validate(&self, sql: &str) -> ValidationOutcome;

    fn violation_report(&self, sql: &str) -> String;

    fn is_read_only(&self, sql: &str) -> bool {
        self.validate(sql).is_valid
    }
}

#[derive(Debug, Clone)]
pub struct SafetyValidator {
    keywords: Vec<(&'static str, Regex)>,
    patterns: Vec<Regex>,
}

impl SafetyValidator {
    /// Compile the denylist keyword and phrase patterns.
    ///
    /// # Errors
    /// Returns [`SafetyError::Pattern`] if a pattern fails to compile.
    pub fn new() -> Result<Self, SafetyError> {
        let keywords = DANGEROUS_KEYWORDS
            .iter()
            .map(|keyword| Ok((*keyword, compile(&format!(r"\b{keyword}\b"))?)))
            .collect::<Result<Vec<_>, SafetyError>>()?;
        let patterns = DANGEROUS_PATTERNS
            .iter()
            .map(|pattern| compile(&format!("(?i){pattern}")))
            .collect::<Result<Vec<_>, SafetyError>>()?;
        Ok(Self { keywords, patterns })
    }
}

impl SqlGuard for SafetyValidator {
    fn validate(&self, sql: &str) -> ValidationOutcome {
        if sql.trim().is_empty() {
            return ValidationOutcome::blocked("Empty SQL query", Vec::new());
        }

        let normalized = normalize_sql(sql);

        let mut violations: Vec<String> = Vec::new();
        for (keyword, regex) in &self.keywords {
            if regex.is_match(&normalized) {
                violations.push((*keyword).to_string());
            }
        }
        for regex in &self.patterns {
            if let Some(found) = regex.find(&normalized) {
                let text = found.as_str().to_string();
                if !violations.contains(&text) {
                    violations.push(text);
                }
            }
        }

        if !violations.is_empty() {
            let message = format!(
                "BLOCKED: Query contains dangerous operations: {}",
                violations.join(", ")
            );
            return ValidationOutcome::blocked(message, violations);
        }

        let first_token = normalized.split(' ').next().unwrap_or_default();
        if !ALLOWED_LEADING_TOKENS.contains(&first_token) {
            return ValidationOutcome::blocked(
                format!("BLOCKED: Only SELECT queries are allowed. Found: {first_token}"),
                vec![first_token.to_string()],
            );
        }

        ValidationOutcome::safe()
    }

    fn violation_report(&self, sql: &str) -> String {
        let outcome = self.validate(sql);
        if outcome.is_valid {
            return format!("SAFE: {}", outcome.message);
        }

        let mut query_preview: String = sql.chars().take(REPORT_QUERY_CHARS).collect();
        if sql.chars().count() > REPORT_QUERY_CHARS {
            query_preview.push_str("...");
        }

        let mut lines = vec![
            REPORT_RULE.to_string(),
            "SQL SAFETY VIOLATION DETECTED".to_string(),
            REPORT_RULE.to_string(),
            format!("Query: {query_preview}"),
            format!("\nViolations Found: {}", outcome.violations.len()),
        ];
        for (index, violation) in outcome.violations.iter().enumerate() {
            lines.push(format!("  {}. {violation}", index + 1));
        }
        lines.push(format!("\nReason: {}", outcome.message));
        lines.push("\nOnly SELECT queries are allowed for safety.".to_string());
        lines.push(REPORT_RULE.to_string());

        lines.join("\n")
    }
}

/// Uppercase and collapse every whitespace run to a single space.
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    sql.to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn compile(pattern: &str) -> Result<Regex, SafetyError> {
    Regex::new(pattern).map_err(|source| SafetyError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}
