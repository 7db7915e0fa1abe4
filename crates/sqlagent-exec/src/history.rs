//! Persistent run history in a local SQLite file.
//!
//! Every finished run is written as one `agent_runs` row plus one
//! `agent_steps` row per attempt, inside a single transaction.

use std::path::Path;

use sqlagent_types::{AgentError, Observation, Result, RunOutcome, RunReport};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Summary row for a stored run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub question: String,
    pub status: String,
    pub iterations: i64,
    pub final_error_kind: Option<String>,
    pub final_query: Option<String>,
}

/// One stored attempt.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredStep {
    pub iteration: i64,
    pub query: String,
    pub status: String,
    pub error_kind: Option<String>,
    pub row_count: Option<i64>,
    pub elapsed_ms: i64,
}

pub struct RunLog {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> AgentError {
    AgentError::Database(e.to_string())
}

impl RunLog {
    /// Open (creating if needed) the history database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    /// Private in-memory history; a single connection keeps the database alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_runs (
                run_id           TEXT    PRIMARY KEY,
                question         TEXT    NOT NULL,
                provider         TEXT    NOT NULL,
                model            TEXT    NOT NULL,
                status           TEXT    NOT NULL,
                iterations       INTEGER NOT NULL,
                final_error_kind TEXT,
                final_message    TEXT,
                final_query      TEXT,
                final_rows       TEXT,
                started_at       TEXT    NOT NULL,
                created_at       TEXT    NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_steps (
                run_id           TEXT    NOT NULL REFERENCES agent_runs(run_id),
                iteration        INTEGER NOT NULL,
                query            TEXT    NOT NULL,
                status           TEXT    NOT NULL,
                error_kind       TEXT,
                message          TEXT,
                row_count        INTEGER,
                elapsed_ms       INTEGER NOT NULL,
                rows             TEXT,
                generator_output TEXT    NOT NULL,
                PRIMARY KEY (run_id, iteration)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;

        Ok(Self { pool })
    }

    /// Store a finished run and all of its steps atomically.
    pub async fn save(&self, report: &RunReport) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let (status, final_error_kind, final_message, final_rows) = match &report.outcome {
            RunOutcome::Succeeded { observation, .. } => {
                ("success", None, None, rows_json(observation)?)
            }
            RunOutcome::Aborted(failure) => (
                "error",
                failure
                    .last_observation
                    .error_kind()
                    .map(|k| k.as_str().to_string()),
                Some(failure.message.clone()),
                None,
            ),
            RunOutcome::GenerationFailed { error, .. } => {
                ("generation_failed", None, Some(error.clone()), None)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO agent_runs
                (run_id, question, provider, model, status, iterations,
                 final_error_kind, final_message, final_query, final_rows, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.run_id.to_string())
        .bind(&report.question)
        .bind(&report.provider)
        .bind(&report.model)
        .bind(status)
        .bind(i64::from(report.iterations()))
        .bind(final_error_kind)
        .bind(final_message)
        .bind(report.outcome.final_query())
        .bind(final_rows)
        .bind(report.started_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for step in &report.steps {
            let generator_output = serde_json::json!({
                "sql_query": step.query,
                "reasoning": step.rationale,
                "confidence": step.confidence,
                "guidance": step.guidance,
            });
            let (status, row_count) = match &step.observation {
                Observation::Success { row_count, .. } => ("success", Some(*row_count as i64)),
                Observation::Error { .. } => ("error", None),
            };

            sqlx::query(
                r#"
                INSERT INTO agent_steps
                    (run_id, iteration, query, status, error_kind, message,
                     row_count, elapsed_ms, rows, generator_output)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(report.run_id.to_string())
            .bind(i64::from(step.iteration))
            .bind(&step.query)
            .bind(status)
            .bind(step.observation.error_kind().map(|k| k.as_str()))
            .bind(step.observation.message())
            .bind(row_count)
            .bind(step.elapsed_ms as i64)
            .bind(rows_json(&step.observation)?)
            .bind(generator_output.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(run_id = %report.run_id, steps = report.steps.len(), "Run saved to history");
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64, Option<String>, Option<String>)>(
            r#"
            SELECT run_id, question, status, iterations, final_error_kind, final_query
            FROM agent_runs
            ORDER BY started_at DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(run_id, question, status, iterations, final_error_kind, final_query)| RunSummary {
                    run_id,
                    question,
                    status,
                    iterations,
                    final_error_kind,
                    final_query,
                },
            )
            .collect())
    }

    pub async fn steps(&self, run_id: &str) -> Result<Vec<StoredStep>> {
        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, Option<i64>, i64)>(
            r#"
            SELECT iteration, query, status, error_kind, row_count, elapsed_ms
            FROM agent_steps
            WHERE run_id = ?
            ORDER BY iteration
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(iteration, query, status, error_kind, row_count, elapsed_ms)| StoredStep {
                    iteration,
                    query,
                    status,
                    error_kind,
                    row_count,
                    elapsed_ms,
                },
            )
            .collect())
    }
}

fn rows_json(observation: &Observation) -> Result<Option<String>> {
    match observation {
        Observation::Success { rows, .. } => Ok(Some(serde_json::to_string(rows)?)),
        Observation::Error { .. } => Ok(None),
    }
}
