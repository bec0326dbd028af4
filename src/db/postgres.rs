//! PostgreSQL execution source.
//!
//! Provides the `PostgresClient` struct that implements the `DatabaseClient` trait
//! on top of a sqlx connection pool shared by every worker of a run.

use crate::config::ConnectionConfig;
use crate::db::{ColumnInfo, DatabaseClient, QueryResult, Row, Value};
use crate::error::{ReportError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::types::{PgInterval, PgMoney};
use sqlx::postgres::{PgColumn, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::types::Uuid;
use sqlx::{Column as SqlxColumn, Decode, Executor, Row as SqlxRow, Type, TypeInfo};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL execution source backed by a connection pool.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Creates a new PostgresClient from an existing connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens the pool, retrying transient failures with exponential backoff.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;

        loop {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            let result = PgPoolOptions::new()
                .max_connections(config.pool_size)
                .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
                .connect(&conn_str)
                .await;

            match result {
                Ok(pool) => {
                    debug!(
                        pool_size = config.pool_size,
                        "Successfully connected to database"
                    );
                    return Ok(Self { pool });
                }
                Err(e) if attempt < MAX_RETRY_ATTEMPTS && is_transient_error(&e) => {
                    warn!(
                        "Connection attempt {} failed (transient error), retrying in {:?}",
                        attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(map_connection_error(e, config)),
            }
        }
    }

    /// Fetches column metadata for a statement without rows to read it from.
    async fn describe_columns(&self, sql: &str) -> Vec<ColumnInfo> {
        match (&self.pool).describe(sql).await {
            Ok(describe) => describe
                .columns()
                .iter()
                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                .collect(),
            Err(e) => {
                warn!("Could not describe empty result columns: {e}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn ping(&self) -> Result<()> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ReportError::connection(format!("Cannot acquire a pooled connection: {e}")))?;
        drop(conn);
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        // fetch_all on the pool holds a connection only for this statement
        let result = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ReportError::query(format_query_error(e)))?;

        let columns: Vec<ColumnInfo> = match result.first() {
            Some(first_row) => first_row
                .columns()
                .iter()
                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                .collect(),
            None => self.describe_columns(sql).await,
        };

        let rows = result.iter().map(convert_row).collect::<Result<Vec<Row>>>()?;

        Ok(QueryResult::with_data(columns, rows))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Largest decimal mantissa whose digits survive a round trip through f64.
const MAX_EXACT_MANTISSA: u128 = 999_999_999_999_999;

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|column| convert_value(row, column))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
///
/// A value that fails to decode is an error, never an empty cell.
fn convert_value(row: &PgRow, column: &PgColumn) -> Result<Value> {
    let value = match column.type_info().name().to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => decode::<bool>(row, column)?.map(Value::Bool),
        "INT2" | "SMALLINT" => decode::<i16>(row, column)?.map(|v| Value::Int(v.into())),
        "INT4" | "INT" | "INTEGER" => decode::<i32>(row, column)?.map(|v| Value::Int(v.into())),
        "INT8" | "BIGINT" => decode::<i64>(row, column)?.map(Value::Int),
        "FLOAT4" | "REAL" => decode::<f32>(row, column)?.map(|v| Value::Float(v.into())),
        "FLOAT8" | "DOUBLE PRECISION" => decode::<f64>(row, column)?.map(Value::Float),

        // Averages and sums over integer columns come back as NUMERIC
        "NUMERIC" | "DECIMAL" => convert_numeric(row, column)?,
        "MONEY" => decode::<PgMoney>(row, column)?.map(|m| decimal_value(m.to_decimal(2))),

        "DATE" => decode::<NaiveDate>(row, column)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        "TIME" => decode::<NaiveTime>(row, column)?
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string())),
        "TIMESTAMP" => decode::<NaiveDateTime>(row, column)?
            .map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string())),
        "TIMESTAMPTZ" => decode::<DateTime<Utc>>(row, column)?
            .map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S%:z").to_string())),
        "INTERVAL" => {
            decode::<PgInterval>(row, column)?.map(|i| Value::String(format_interval(&i)))
        }
        "UUID" => decode::<Uuid>(row, column)?.map(|u| Value::String(u.to_string())),

        "JSON" | "JSONB" => decode::<serde_json::Value>(row, column)?.map(Value::Json),
        "BYTEA" => decode::<Vec<u8>>(row, column)?.map(Value::Bytes),

        "INT4[]" => decode::<Vec<Option<i32>>>(row, column)?.map(array),
        "INT8[]" => decode::<Vec<Option<i64>>>(row, column)?.map(array),
        "FLOAT8[]" => decode::<Vec<Option<f64>>>(row, column)?.map(array),
        "TEXT[]" | "VARCHAR[]" => decode::<Vec<Option<String>>>(row, column)?.map(array),

        _ => convert_other(row, column)?,
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode<'r, T>(row: &'r PgRow, column: &PgColumn) -> Result<Option<T>>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(column.ordinal())
        .map_err(|e| decode_error(column, e))
}

fn decode_error(column: &PgColumn, cause: impl fmt::Display) -> ReportError {
    ReportError::query(format!(
        "Cannot read column '{}' ({}): {cause}",
        column.name(),
        column.type_info().name()
    ))
}

fn array<T: Into<Value>>(items: Vec<Option<T>>) -> Value {
    Value::Array(items.into_iter().map(Value::from).collect())
}

/// Decodes NUMERIC, falling back to its exact text for NaN, infinities and
/// values wider than `Decimal` holds.
fn convert_numeric(row: &PgRow, column: &PgColumn) -> Result<Option<Value>> {
    if let Ok(decimal) = row.try_get::<Option<Decimal>, _>(column.ordinal()) {
        return Ok(decimal.map(decimal_value));
    }
    let Some(raw) = raw_bytes(row, column)? else {
        return Ok(None);
    };
    numeric_text(&raw)
        .map(|text| Some(Value::String(text)))
        .ok_or_else(|| decode_error(column, "malformed numeric value"))
}

/// A decimal becomes a number cell when f64 keeps all of its digits, text otherwise.
fn decimal_value(decimal: Decimal) -> Value {
    let decimal = decimal.normalize();
    if decimal.mantissa().unsigned_abs() <= MAX_EXACT_MANTISSA {
        if let Some(f) = decimal.to_f64() {
            return Value::Float(f);
        }
    }
    Value::String(decimal.to_string())
}

/// Text-like types decode as strings. Anything else is kept as raw bytes,
/// which the artifact writer rejects as unrepresentable.
fn convert_other(row: &PgRow, column: &PgColumn) -> Result<Option<Value>> {
    if let Ok(text) = row.try_get::<Option<String>, _>(column.ordinal()) {
        return Ok(text.map(Value::String));
    }
    debug!(
        column = column.name(),
        type_name = column.type_info().name(),
        "No cell mapping for column type"
    );
    Ok(raw_bytes(row, column)?.map(Value::Bytes))
}

fn raw_bytes(row: &PgRow, column: &PgColumn) -> Result<Option<Vec<u8>>> {
    row.try_get_unchecked::<Option<Vec<u8>>, _>(column.ordinal())
        .map_err(|e| decode_error(column, e))
}

/// Renders a binary NUMERIC value as PostgreSQL prints it.
///
/// Layout: ndigits, weight, sign and dscale as big-endian 16-bit words,
/// then `ndigits` base-10000 digits.
fn numeric_text(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = usize::from(word(0)?);
    let weight = word(1)? as i16;
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Option<Vec<u16>>>()?;
    let digit_at = |pos: i32| {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for pos in 0..=i32::from(weight) {
            if pos == 0 {
                text.push_str(&digit_at(pos).to_string());
            } else {
                text.push_str(&format!("{:04}", digit_at(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = i32::from(weight) + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}

/// Formats an interval the way PostgreSQL's default output style does.
fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let units = [
        (interval.months / 12, "year"),
        (interval.months % 12, "mon"),
        (interval.days, "day"),
    ];
    for (n, unit) in units {
        if n != 0 {
            let plural = if n.abs() == 1 { "" } else { "s" };
            parts.push(format!("{n} {unit}{plural}"));
        }
    }

    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let secs = micros / 1_000_000;
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let fraction = micros % 1_000_000;
        if fraction != 0 {
            let digits = format!("{fraction:06}");
            time.push('.');
            time.push_str(digits.trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    if matches!(error, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
        return true;
    }

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
        || error_str.contains("ssl")
        || error_str.contains("tls")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> ReportError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        ReportError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ReportError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ReportError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("ssl") || error_str.contains("tls") {
        ReportError::connection(
            "Server requires SSL. Set sslmode = \"require\" in the [database] section.".to_string(),
        )
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ReportError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ReportError::connection(error.to_string())
    }
}

/// Formats a query error with PostgreSQL detail and hint if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }

        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }

        if let Some(column) = pg_error.column() {
            result.push_str("\n  COLUMN: ");
            result.push_str(column);
        }
    }

    result
}
