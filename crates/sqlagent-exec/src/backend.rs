use async_trait::async_trait;
use serde_json::Value;
use sqlagent_types::AgentError;

/// Bounds applied to every candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Server-side statement timeout (and client-side deadline) in milliseconds.
    pub statement_timeout_ms: u64,
    /// Maximum number of rows kept from a result set.
    pub max_rows: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 5_000,
            max_rows: 5,
        }
    }
}

impl QueryLimits {
    pub fn validate(&self) -> sqlagent_types::Result<()> {
        if self.statement_timeout_ms == 0 {
            return Err(AgentError::Config(
                "statement_timeout_ms must be at least 1".into(),
            ));
        }
        if self.max_rows == 0 {
            return Err(AgentError::Config("max_rows must be at least 1".into()));
        }
        Ok(())
    }
}

/// What a backend produced for a single statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// The statement ran (or was prepared) but describes no result columns.
    NoResultSet,
}

/// Where a database failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// Could not open or authenticate a session.
    Connect,
    /// The server (or engine) rejected the statement.
    Execute,
    /// The client-side deadline elapsed.
    Deadline,
}

/// A failed database interaction, reduced to what the classifier needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DbFailure {
    /// SQLSTATE (Postgres) or extended result code (SQLite), when the driver reported one.
    pub code: Option<String>,
    pub message: String,
    pub origin: FailureOrigin,
}

impl DbFailure {
    pub fn new(origin: FailureOrigin, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
            origin,
        }
    }

    pub fn deadline(timeout_ms: u64) -> Self {
        Self::new(
            FailureOrigin::Deadline,
            None,
            format!("query exceeded the {timeout_ms}ms statement timeout"),
        )
    }

    /// Map a failure that happened while opening a session.
    pub fn connect(err: sqlx::Error) -> Self {
        let mut failure = Self::from(err);
        failure.origin = FailureOrigin::Connect;
        failure
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    pub fn message_contains(&self, needle: &str) -> bool {
        self.message.to_ascii_lowercase().contains(needle)
    }
}

impl std::fmt::Display for DbFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<sqlx::Error> for DbFailure {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => Self {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
                origin: FailureOrigin::Execute,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => Self::new(FailureOrigin::Connect, None, err.to_string()),
            _ => Self::new(FailureOrigin::Execute, None, err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// SqlBackend
// ---------------------------------------------------------------------------

/// A database the agent can run read-only statements against.
///
/// Implementations own their session lifecycle: every call opens a fresh
/// session and releases it before returning, whatever the outcome.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run one statement read-only, returning at most `limits.max_rows` rows.
    async fn run_query(&self, sql: &str, limits: &QueryLimits) -> Result<QueryOutput, DbFailure>;

    /// Compact `table(column type, ...)` listing of the user tables.
    async fn describe_schema(&self) -> Result<String, DbFailure>;

    /// Connectivity check (`SELECT 1`).
    async fn ping(&self) -> Result<(), DbFailure>;

    fn name(&self) -> &str;
}

/// Render `(table, column, type)` triples, already ordered by table, as one line per table.
pub(crate) fn render_schema(columns: &[(String, String, String)]) -> String {
    let mut out = String::new();
    let mut current: Option<&str> = None;

    for (table, column, data_type) in columns {
        if current != Some(table.as_str()) {
            if current.is_some() {
                out.push_str(")\n");
            }
            out.push_str(table);
            out.push('(');
            current = Some(table.as_str());
        } else {
            out.push_str(", ");
        }
        out.push_str(column);
        if !data_type.is_empty() {
            out.push(' ');
            out.push_str(&data_type.to_ascii_lowercase());
        }
    }
    if current.is_some() {
        out.push(')');
    }
    out
}
