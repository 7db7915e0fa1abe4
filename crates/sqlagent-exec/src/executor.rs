use std::time::{Duration, Instant};

use sqlagent_types::{ErrorKind, Observation};

use crate::backend::{DbFailure, QueryLimits, QueryOutput, SqlBackend};
use crate::classify::classify;
use crate::truncation::observation_message;

pub const NO_RESULT_SET_MESSAGE: &str = "This query did not return rows";
pub const NO_RESULT_SET_HINT: &str = "Remove DDL/DML statements";
pub const SYNTAX_HINT: &str = "Fix SQL syntax";
pub const GENERIC_HINT: &str = "Check schema, joins, and aggregation";

/// Runs candidate queries and reports each outcome as an [`Observation`].
///
/// Never fails: every database problem is folded into an error observation.
/// Performs no retries.
pub struct QueryExecutor {
    backend: Box<dyn SqlBackend>,
    limits: QueryLimits,
}

impl QueryExecutor {
    pub fn new(backend: Box<dyn SqlBackend>, limits: QueryLimits) -> Self {
        Self { backend, limits }
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    pub fn backend(&self) -> &dyn SqlBackend {
        self.backend.as_ref()
    }

    pub async fn execute(&self, sql: &str, iteration: u32) -> Observation {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.limits.statement_timeout_ms);

        let result = match tokio::time::timeout(deadline, self.backend.run_query(sql, &self.limits)).await {
            Ok(result) => result,
            Err(_) => Err(DbFailure::deadline(self.limits.statement_timeout_ms)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(QueryOutput::Rows { columns, mut rows }) => {
                rows.truncate(self.limits.max_rows);
                tracing::debug!(
                    iteration,
                    row_count = rows.len(),
                    elapsed_ms,
                    backend = self.backend.name(),
                    "Query succeeded"
                );
                Observation::success(iteration, columns, rows)
            }
            Ok(QueryOutput::NoResultSet) => {
                tracing::warn!(iteration, elapsed_ms, "Query produced no result set");
                Observation::error(
                    iteration,
                    ErrorKind::PermissionError,
                    NO_RESULT_SET_MESSAGE,
                    Some(NO_RESULT_SET_HINT.to_string()),
                )
            }
            Err(failure) => {
                let kind = classify(&failure);
                tracing::info!(
                    iteration,
                    error_kind = %kind,
                    code = failure.code.as_deref().unwrap_or(""),
                    elapsed_ms,
                    "Query failed"
                );
                Observation::error(
                    iteration,
                    kind,
                    observation_message(&failure.message),
                    Some(hint_for(kind).to_string()),
                )
            }
        }
    }
}

fn hint_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::SyntaxError => SYNTAX_HINT,
        _ => GENERIC_HINT,
    }
}
