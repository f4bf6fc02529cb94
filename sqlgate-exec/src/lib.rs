//! Guarded execution of validated SQL against a live database.
//!
//! This is the second line of defense behind the policy validator: the
//! validator's structural guarantees are assumed fallible, so the executor
//! independently enforces "no observable effect" by result shape. Exactly one
//! statement runs per call, inside an explicit transaction, and anything that
//! does not produce a result set is rolled back and refused.

use std::sync::Once;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::TryStreamExt;
use serde_json::{Map, Number, Value as JsonValue};
use sqlgate_core::{RejectKind, Rejection};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Executor, Row as SqlxRow};
use thiserror::Error;
use tracing::{debug, warn};

/// One result row: column name to JSON scalar, in result-set order.
pub type Row = Map<String, JsonValue>;

/// Hard cap on materialized rows, independent of any LIMIT clause. This is
/// the backstop for limits bound as parameters, which the validator cannot
/// inspect before execution.
pub const DEFAULT_MAX_ROWS: usize = 10_000;

static DRIVERS: Once = Once::new();

/// Register the bundled sqlx `Any` drivers. Safe to call repeatedly.
pub fn install_default_drivers() {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The statement yields no result set: treated as a mutation that slipped
    /// past the validator. The transaction was rolled back and the statement
    /// never ran.
    #[error("non-query SQL detected; operation rolled back")]
    NonQuery,
    /// Any database-side failure. `Display` stays generic so raw server error
    /// text never reaches callers; the driver error is kept as `source` for
    /// internal logging.
    #[error("database execution failed")]
    Runtime(#[source] sqlx::Error),
}

impl ExecuteError {
    pub fn kind(&self) -> RejectKind {
        match self {
            ExecuteError::NonQuery => RejectKind::ExecutionNonQuery,
            ExecuteError::Runtime(_) => RejectKind::ExecutionRuntime,
        }
    }

    pub fn to_rejection(&self) -> Rejection {
        Rejection::new(self.kind(), self.to_string())
    }
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecuteError>;
}

/// Executor over a pooled connection that holds every statement to the
/// read-only contract, whatever the validator concluded. One connection and
/// one transaction per call; both are released on every exit path.
#[derive(Debug, Clone)]
pub struct GuardedExecutor {
    pool: AnyPool,
    max_rows: usize,
}

impl GuardedExecutor {
    /// Connect to a database URL (`sqlite:`, `postgres:`, `mysql:`).
    pub async fn connect(url: &str) -> Result<Self, ExecuteError> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(ExecuteError::Runtime)?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: AnyPool) -> Self {
        Self {
            pool,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    /// Override the materialization cap.
    pub fn max_rows(mut self, max_rows: usize) -> Self {
        assert!(max_rows > 0, "max_rows must be positive");
        self.max_rows = max_rows;
        self
    }
}

#[async_trait]
impl SqlExecutor for GuardedExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
        let mut tx = self.pool.begin().await.map_err(ExecuteError::Runtime)?;

        // Prepare first: a statement with no result columns cannot be a
        // read, so it is refused before it ever runs.
        let described = (&mut *tx).describe(sql).await.map_err(|err| {
            warn!(error = %err, "statement refused by the database");
            ExecuteError::Runtime(err)
        })?;
        if described.columns().is_empty() {
            warn!("statement yields no result set; rolling back");
            tx.rollback().await.map_err(ExecuteError::Runtime)?;
            return Err(ExecuteError::NonQuery);
        }

        let mut rows = Vec::new();
        {
            let mut stream = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await.map_err(ExecuteError::Runtime)? {
                rows.push(row_to_record(&row));
                if rows.len() >= self.max_rows {
                    debug!(max_rows = self.max_rows, "row cap reached; truncating result");
                    break;
                }
            }
        }
        tx.commit().await.map_err(ExecuteError::Runtime)?;

        debug!(rows = rows.len(), "query executed");
        Ok(rows)
    }
}

fn row_to_record(row: &AnyRow) -> Row {
    let mut record = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), decode_scalar(row, idx));
    }
    record
}

/// Decode one column into a JSON scalar, trying the narrowest type first.
/// Driver types outside the supported set degrade to NULL rather than failing
/// the whole row.
fn decode_scalar(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return value
            .and_then(Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
        return value.map(JsonValue::Bool).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return value.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return value
            .map(|bytes| JsonValue::String(BASE64_STANDARD.encode(bytes)))
            .unwrap_or(JsonValue::Null);
    }
    JsonValue::Null
}
