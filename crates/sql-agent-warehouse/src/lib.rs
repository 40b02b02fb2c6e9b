#![forbid(unsafe_code)]
//! Warehouse round trip: SQL in, bounded rows or a query error out.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ROW_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WarehouseConfig {
    pub row_limit: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
        }
    }
}

/// Materialized rows of one statement. `rows` holds at most the configured
/// row limit; `total_rows` counts everything the statement produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: usize,
}

impl QueryRows {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let total_rows = rows.len();
        Self {
            columns,
            rows,
            total_rows,
        }
    }

    #[must_use]
    pub fn truncated(columns: Vec<String>, rows: Vec<Vec<Value>>, total_rows: usize) -> Self {
        Self {
            columns,
            rows,
            total_rows,
        }
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.rows.len() < self.total_rows
    }

    #[must_use]
    pub fn render(&self) -> String {
        if self.total_rows == 0 {
            return "Query executed successfully. No results returned.".to_string();
        }
        let listing = self.render_listing();
        if self.is_truncated() {
            let shown = self.rows.len();
            format!(
                "Results (showing {shown} of {} rows):\n{listing}\n\nNote: Showing first {shown} rows.",
                self.total_rows
            )
        } else {
            format!("Results ({} rows):\n{listing}", self.total_rows)
        }
    }

    fn render_listing(&self) -> String {
        let records: Vec<String> = self
            .rows
            .iter()
            .map(|row| {
                let fields: Vec<String> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| {
                        format!("{}: {}", quote_text(column), render_value(value))
                    })
                    .collect();
                format!("{{{}}}", fields.join(", "))
            })
            .collect();
        format!("[{}]", records.join(", "))
    }
}

/// Result of one `execute` call that reached the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows(QueryRows),
    Failed { message: String },
}

impl QueryOutcome {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Rows(_))
    }

    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Rows(rows) => rows.render(),
            Self::Failed { message } => format!("Error executing query: {message}"),
        }
    }
}

pub trait QueryExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(QueryOutcome::Failed)` is a query the warehouse rejected;
    /// `Err` means the warehouse could not be reached at all.
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, sql: &str) -> Result<QueryOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn schema_info(&self, use_cache: bool) -> Result<String>;

    fn clear_schema_cache(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Render discovered catalog metadata as the text handed to SQL generation.
#[must_use]
pub fn render_schema(database: &str, schema: &str, tables: &[TableInfo]) -> String {
    if tables.is_empty() {
        return format!("No tables found in {database}.{schema}");
    }
    let mut out = format!(
        "Database: {database}\nSchema: {schema}\nTables ({}):\n\n",
        tables.len()
    );
    for table in tables {
        out.push_str(&format!(
            "Table: {} ({} columns)\n",
            table.name,
            table.columns.len()
        ));
        out.push_str("Columns:\n");
        for column in &table.columns {
            let nullable = if column.nullable { "[NULL]" } else { "[NOT NULL]" };
            out.push_str(&format!(
                "  - {}: {} {nullable}\n",
                column.name, column.data_type
            ));
        }
        out.push('\n');
    }
    out
}

/// Read-only executor over a local `SQLite` database.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
    database: String,
    config: WarehouseConfig,
    schema_cache: Mutex<Option<String>>,
}

impl SqliteWarehouse {
    /// Open a warehouse file with writes disabled on the connection.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: &Path, config: WarehouseConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open warehouse database at {}", path.display()))?;
        let database = path
            .file_stem()
            .map_or_else(|| "main".to_string(), |stem| stem.to_string_lossy().into_owned());
        Self::from_connection(conn, &database, config)
    }

    /// Wrap an existing connection, e.g. an in-memory database seeded by a test.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be switched to query-only mode.
    pub fn from_connection(conn: Connection, database: &str, config: WarehouseConfig) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA query_only = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure warehouse pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
            database: database.to_string(),
            config,
            schema_cache: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> WarehouseConfig {
        self.config
    }

    fn discover_tables(conn: &Connection) -> Result<Vec<TableInfo>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list warehouse tables")?;

        let mut column_stmt = conn.prepare(
            "SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid ASC",
        )?;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = column_stmt
                .query_map(params![name], |row| {
                    let data_type: String = row.get(1)?;
                    Ok(ColumnInfo {
                        name: row.get(0)?,
                        data_type: if data_type.is_empty() {
                            "ANY".to_string()
                        } else {
                            data_type
                        },
                        nullable: row.get::<_, i64>(2)? == 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to read columns of table {name}"))?;
            tables.push(TableInfo { name, columns });
        }
        Ok(tables)
    }

    fn run_statement(&self, conn: &Connection, sql: &str) -> rusqlite::Result<QueryRows> {
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();

        let mut rows = stmt.query([])?;
        let mut kept = Vec::new();
        let mut total_rows = 0_usize;
        while let Some(row) = rows.next()? {
            total_rows += 1;
            if kept.len() < self.config.row_limit {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(sql_value_to_json(row.get_ref(idx)?));
                }
                kept.push(values);
            }
        }
        Ok(QueryRows::truncated(columns, kept, total_rows))
    }
}

impl QueryExecutor for SqliteWarehouse {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("warehouse connection lock poisoned"))?;
        match self.run_statement(&conn, sql) {
            Ok(rows) => {
                tracing::debug!(total_rows = rows.total_rows, "warehouse query succeeded");
                Ok(QueryOutcome::Rows(rows))
            }
            Err(err) => {
                tracing::debug!(error = %err, "warehouse rejected query");
                Ok(QueryOutcome::failed(err.to_string()))
            }
        }
    }

    fn schema_info(&self, use_cache: bool) -> Result<String> {
        let mut cache = self
            .schema_cache
            .lock()
            .map_err(|_| anyhow!("schema cache lock poisoned"))?;
        if use_cache {
            if let Some(cached) = cache.as_ref() {
                return Ok(cached.clone());
            }
        }

        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("warehouse connection lock poisoned"))?;
        let tables = Self::discover_tables(&conn)?;
        let rendered = render_schema(&self.database, "main", &tables);
        tracing::debug!(tables = tables.len(), "discovered warehouse schema");
        *cache = Some(rendered.clone());
        Ok(rendered)
    }

    fn clear_schema_cache(&self) {
        *self
            .schema_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => quote_text(text),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(key, item)| format!("{}: {}", quote_text(key), render_value(item)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Quote text the way the result listing has always shown it: single quotes
/// unless the text holds a single quote and no double quote.
fn quote_text(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Test double replaying canned outcomes. The last outcome keeps repeating.
#[derive(Debug, Default)]
pub struct ScriptedQueryExecutor {
    outcomes: Mutex<VecDeque<QueryOutcome>>,
    schema: String,
    executed: Mutex<Vec<String>>,
    schema_calls: Mutex<usize>,
}

impl ScriptedQueryExecutor {
    #[must_use]
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_outcome(self, outcome: QueryOutcome) -> Self {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    #[must_use]
    pub fn with_rows(self, rows: QueryRows) -> Self {
        self.with_outcome(QueryOutcome::Rows(rows))
    }

    #[must_use]
    pub fn with_failure(self, message: &str) -> Self {
        self.with_outcome(QueryOutcome::failed(message))
    }

    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn execute_calls(&self) -> usize {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn schema_calls(&self) -> usize {
        *self
            .schema_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueryExecutor for ScriptedQueryExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        self.executed
            .lock()
            .map_err(|_| anyhow!("scripted executor log poisoned"))?
            .push(sql.to_string());
        let mut outcomes = self
            .outcomes
            .lock()
            .map_err(|_| anyhow!("scripted executor outcomes poisoned"))?;
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front()
        } else {
            outcomes.front().cloned()
        };
        outcome.ok_or_else(|| anyhow!("no scripted outcome for query: {sql}"))
    }

    fn schema_info(&self, _use_cache: bool) -> Result<String> {
        *self
            .schema_calls
            .lock()
            .map_err(|_| anyhow!("scripted executor counter poisoned"))? += 1;
        Ok(self.schema.clone())
    }

    fn clear_schema_cache(&self) {}
}
