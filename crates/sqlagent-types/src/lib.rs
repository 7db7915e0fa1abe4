//! Shared types and errors for the SQL agent workspace.
//!
//! This crate provides the foundational types used across all other sqlagent crates:
//! - `AgentError`: unified error taxonomy
//! - `ErrorKind`: semantic classification of a failed query execution
//! - `Observation`: result of executing one candidate query
//! - `RepairGuidance`: advice fed into the next generation attempt
//! - `RunOutcome` / `FailureRecord`: terminal result of a run
//! - `RunReport`: per-step record of a run, consumed by history persistence
//! - `RunFailure`: a run cut short by its generator, with its partial report

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for all sqlagent subsystems.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // === LLM Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out")]
    RequestTimeout { provider: String },

    // === Generation Errors ===
    #[error("Generation contract violated: {0}")]
    ContractViolation(String),

    // === Configuration / Storage ===
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Returns `true` when a collaborator broke its contract (as opposed to a transport failure).
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, AgentError::ContractViolation(_))
    }

    /// Transient provider failures worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::RateLimited { .. } | AgentError::RequestTimeout { .. } => true,
            AgentError::ProviderError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A convenience alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// ErrorKind: semantic class of an execution failure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    TableNotFound,
    ColumnNotFound,
    AmbiguousColumn,
    AggregationError,
    PermissionError,
    Timeout,
    UnknownError,
}

impl ErrorKind {
    /// Kinds that describe a problem with the query's structure and may be repaired.
    pub const RECOVERABLE: [ErrorKind; 5] = [
        ErrorKind::SyntaxError,
        ErrorKind::ColumnNotFound,
        ErrorKind::TableNotFound,
        ErrorKind::AmbiguousColumn,
        ErrorKind::AggregationError,
    ];

    pub fn is_recoverable(self) -> bool {
        Self::RECOVERABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::ColumnNotFound => "column_not_found",
            ErrorKind::AmbiguousColumn => "ambiguous_column",
            ErrorKind::AggregationError => "aggregation_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Observation: result of one execution attempt
// ---------------------------------------------------------------------------

/// Structured result of executing a candidate query.
///
/// The `status` tag selects which field group is present, so a success never
/// carries an error kind and an error never carries rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Observation {
    Success {
        iteration: u32,
        row_count: usize,
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Error {
        iteration: u32,
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

impl Observation {
    /// Build a success observation. `row_count` is derived from `rows`.
    pub fn success(iteration: u32, columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Observation::Success {
            iteration,
            row_count: rows.len(),
            columns,
            rows,
        }
    }

    pub fn error(
        iteration: u32,
        error_kind: ErrorKind,
        message: impl Into<String>,
        hint: Option<String>,
    ) -> Self {
        Observation::Error {
            iteration,
            error_kind,
            message: message.into(),
            hint,
        }
    }

    pub fn iteration(&self) -> u32 {
        match self {
            Observation::Success { iteration, .. } | Observation::Error { iteration, .. } => {
                *iteration
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Observation::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Observation::Error { error_kind, .. } => Some(*error_kind),
            Observation::Success { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Observation::Error { message, .. } => Some(message),
            Observation::Success { .. } => None,
        }
    }

    /// The reduced view handed back to the query generator.
    pub fn digest(&self) -> ObservationDigest {
        match self {
            Observation::Success {
                row_count, columns, ..
            } => ObservationDigest {
                status: "success".into(),
                error_kind: None,
                message: None,
                columns: Some(columns.clone()),
                row_count: Some(*row_count),
            },
            Observation::Error {
                error_kind,
                message,
                ..
            } => ObservationDigest {
                status: "error".into(),
                error_kind: Some(*error_kind),
                message: Some(message.clone()),
                columns: None,
                row_count: None,
            },
        }
    }
}

/// Observation reduced to status, error kind, message, columns, and row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDigest {
    pub status: String,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub columns: Option<Vec<String>>,
    pub row_count: Option<usize>,
}

// ---------------------------------------------------------------------------
// RepairGuidance: advisory output of the repair strategist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairGuidance {
    ReviseQuery {
        instructions: String,
        constraints: Vec<String>,
    },
    Abort {
        reason: String,
    },
}

impl RepairGuidance {
    pub fn is_revise(&self) -> bool {
        matches!(self, RepairGuidance::ReviseQuery { .. })
    }
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Fixed user-facing message attached to every aborted run.
pub const FAILURE_MESSAGE: &str = "Query failed after multiple attempts";

/// Why the retry loop stopped without a successful observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    RepeatedError { error_kind: ErrorKind, repeats: u32 },
    Unrecoverable { error_kind: ErrorKind },
    NoStrategy { error_kind: ErrorKind, detail: String },
    IterationsExhausted { max_iterations: u32 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RepeatedError { error_kind, repeats } => {
                write!(f, "{error_kind} repeated {repeats} times in a row")
            }
            AbortReason::Unrecoverable { error_kind } => {
                write!(f, "{error_kind} is not recoverable")
            }
            AbortReason::NoStrategy { detail, .. } => f.write_str(detail),
            AbortReason::IterationsExhausted { max_iterations } => {
                write!(f, "exhausted {max_iterations} iterations")
            }
        }
    }
}

/// Failure record returned when a run aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub termination: AbortReason,
    pub last_observation: Observation,
    pub last_query: String,
}

impl FailureRecord {
    pub fn new(termination: AbortReason, last_observation: Observation, last_query: String) -> Self {
        Self {
            message: FAILURE_MESSAGE.to_string(),
            termination,
            last_observation,
            last_query,
        }
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RunOutcome {
    #[serde(rename = "success")]
    Succeeded {
        observation: Observation,
        query: String,
    },
    #[serde(rename = "error")]
    Aborted(FailureRecord),
    /// The generator failed or broke its contract; nothing was executed for `iteration`.
    #[serde(rename = "generation_failed")]
    GenerationFailed {
        iteration: u32,
        error: String,
        rejected_query: Option<String>,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }

    /// The observation of the final executed attempt.
    pub fn final_observation(&self) -> Option<&Observation> {
        match self {
            RunOutcome::Succeeded { observation, .. } => Some(observation),
            RunOutcome::Aborted(record) => Some(&record.last_observation),
            RunOutcome::GenerationFailed { .. } => None,
        }
    }

    /// The last query the run produced, including one rejected before execution.
    pub fn final_query(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded { query, .. } => Some(query),
            RunOutcome::Aborted(record) => Some(&record.last_query),
            RunOutcome::GenerationFailed { rejected_query, .. } => rejected_query.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunReport: what a run did, step by step
// ---------------------------------------------------------------------------

/// One generate-then-execute attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub iteration: u32,
    pub query: String,
    pub rationale: String,
    pub confidence: f64,
    pub observation: Observation,
    /// Guidance produced after this step failed, if the strategist was consulted.
    pub guidance: Option<RepairGuidance>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub question: String,
    /// Generator backend that produced the queries, e.g. `google`.
    pub provider: String,
    pub model: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub steps: Vec<StepRecord>,
    pub outcome: RunOutcome,
}

impl RunReport {
    /// Number of executed attempts; equals the final observation's iteration.
    pub fn iterations(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// A run cut short by its generator, with everything recorded up to that point.
///
/// `report.outcome` is always `RunOutcome::GenerationFailed`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: AgentError,
    pub report: Box<RunReport>,
}
