use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo, ValueRef};

use crate::backend::{render_schema, DbFailure, QueryLimits, QueryOutput, SqlBackend};

/// Postgres backend. Each call opens its own connection and runs inside a
/// read-only transaction with a `statement_timeout`, then rolls back.
pub struct PostgresBackend {
    options: PgConnectOptions,
}

impl PostgresBackend {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    async fn open(&self) -> Result<PgConnection, DbFailure> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(DbFailure::connect)
    }
}

/// A failed close never changes the result of the call that used the connection.
async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Failed to close Postgres connection cleanly");
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
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
            SELECT table_name::text, column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = 'public'
            ORDER BY table_name, ordinal_position
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
        "postgres"
    }
}

async fn run_read_only(
    conn: &mut PgConnection,
    sql: &str,
    limits: &QueryLimits,
) -> Result<QueryOutput, DbFailure> {
    let mut tx = conn.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    // SET does not take bind parameters.
    let set_timeout = format!("SET LOCAL statement_timeout = {}", limits.statement_timeout_ms);
    sqlx::query(&set_timeout).execute(&mut *tx).await?;

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

fn row_values(row: &PgRow) -> Vec<Value> {
    (0..row.len()).map(|idx| cell(row, idx)).collect()
}

/// Decode one cell into JSON by its runtime type name. Types without a
/// mapping come back as a `<TYPE>` placeholder string.
fn cell(row: &PgRow, idx: usize) -> Value {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded: Result<Value, sqlx::Error> = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::from),
        "INT2" => row.try_get::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get::<i32, _>(idx).map(Value::from),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| Value::from(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(Value::from),
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .map(|d| match d.to_f64() {
                Some(f) => Value::from(f),
                None => Value::String(d.to_string()),
            }),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => {
            row.try_get::<String, _>(idx).map(Value::String)
        }
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|u| Value::String(u.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::String(d.to_string())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|t| Value::String(t.to_string())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|t| Value::String(t.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|t| Value::String(t.to_rfc3339())),
        _ => row.try_get::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|_| Value::String(format!("<{type_name}>")))
}
