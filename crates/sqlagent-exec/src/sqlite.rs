use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo, ValueRef};

use crate::backend::{render_schema, DbFailure, QueryLimits, QueryOutput, SqlBackend};

/// SQLite backend, opened read-only. SQLite has no server-side statement
/// timeout, so the executor's client-side deadline is the only bound.
pub struct SqliteBackend {
    options: SqliteConnectOptions,
}

impl SqliteBackend {
    /// Open the database at `url` (`sqlite:path/to.db`) in read-only mode.
    pub fn from_url(url: &str) -> Result<Self, DbFailure> {
        let options = SqliteConnectOptions::from_str(url).map_err(DbFailure::connect)?;
        Ok(Self::new(options))
    }

    pub fn new(options: SqliteConnectOptions) -> Self {
        Self {
            options: options.read_only(true),
        }
    }

    async fn open(&self) -> Result<SqliteConnection, DbFailure> {
        SqliteConnection::connect_with(&self.options)
            .await
            .map_err(DbFailure::connect)
    }
}

/// A failed close never changes the result of the call that used the connection.
async fn close(conn: SqliteConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Failed to close SQLite connection cleanly");
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    async fn run_query(&self, sql: &str, limits: &QueryLimits) -> Result<QueryOutput, DbFailure> {
        let mut conn = self.open().await?;
        let result = run_read_only(&mut conn, sql, limits).await;
        close(conn).await;
        result
    }

    async fn describe_schema(&self) -> Result<String, DbFailure> {
        let mut conn = self.open().await?;
        let columns = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT m.name, p.name, p.type
            FROM sqlite_master AS m
            JOIN pragma_table_info(m.name) AS p
            WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
            ORDER BY m.name, p.cid
            "#,
        )
        .fetch_all(&mut conn)
        .await;
        close(conn).await;
        Ok(render_schema(&columns?))
    }

    async fn ping(&self) -> Result<(), DbFailure> {
        let mut conn = self.open().await?;
        let result = sqlx::query("SELECT 1").execute(&mut conn).await;
        close(conn).await;
        result.map(|_| ()).map_err(DbFailure::from)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

async fn run_read_only(
    conn: &mut SqliteConnection,
    sql: &str,
    limits: &QueryLimits,
) -> Result<QueryOutput, DbFailure> {
    let mut tx = conn.begin().await?;

    let statement = (&mut *tx).prepare(sql).await?;
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    if columns.is_empty() {
        tx.rollback().await?;
        return Ok(QueryOutput::NoResultSet);
    }

    let mut rows = Vec::new();
    {
        let mut stream = statement.query().fetch(&mut *tx);
        while rows.len() < limits.max_rows {
            match stream.try_next().await? {
                Some(row) => rows.push(row_values(&row)),
                None => break,
            }
        }
    }
    tx.rollback().await?;

    Ok(QueryOutput::Rows { columns, rows })
}

fn row_values(row: &SqliteRow) -> Vec<Value> {
    (0..row.len()).map(|idx| cell(row, idx)).collect()
}

/// Decode by storage class.
fn cell(row: &SqliteRow, idx: usize) -> Value {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded: Result<Value, sqlx::Error> = match type_name.as_str() {
        "INTEGER" => row.try_get::<i64, _>(idx).map(Value::from),
        "REAL" => row.try_get::<f64, _>(idx).map(Value::from),
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::from),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|b| Value::String(format!("<blob {} bytes>", b.len()))),
        _ => row.try_get::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|_| Value::String(format!("<{type_name}>")))
}
