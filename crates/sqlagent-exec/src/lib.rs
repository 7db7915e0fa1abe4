//! Query execution for the SQL agent.
//!
//! Provides the `SqlBackend` trait with Postgres and SQLite implementations,
//! the `QueryExecutor` that turns each attempt into an `Observation`, the
//! failure classifier, database configuration, and the run history log.

pub mod backend;
pub mod classify;
pub mod config;
pub mod executor;
pub mod history;
pub mod postgres;
pub mod sqlite;
pub mod truncation;

pub use backend::{DbFailure, FailureOrigin, QueryLimits, QueryOutput, SqlBackend};
pub use classify::classify;
pub use config::DbConfig;
pub use executor::QueryExecutor;
pub use history::{RunLog, RunSummary, StoredStep};
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
