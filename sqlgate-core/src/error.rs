//! Typed rejection taxonomy for the gateway.
//!
//! Every way the gateway can refuse a request is a normal, expected outcome
//! carried in a `Result`, never a panic. Messages name the offending
//! table/function/operation so rejections are diagnosable, but execution
//! errors never embed raw server error text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level identifier for every rejection the gateway can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    Syntax,
    MultiStatement,
    WriteOperation,
    BlacklistedTable,
    ForbiddenFunction,
    UnsafeJoin,
    MultiTableFrom,
    SystemVariableAccess,
    ExecutionNonQuery,
    ExecutionRuntime,
}

/// Statement kinds the read-only gate refuses at the root or anywhere in the
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Drop,
    Create,
    Alter,
    Merge,
    /// Non-query statements outside the DML/DDL set (SET, GRANT, EXPLAIN, ...).
    Other,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
            WriteKind::Drop => "DROP",
            WriteKind::Create => "CREATE",
            WriteKind::Alter => "ALTER",
            WriteKind::Merge => "MERGE",
            WriteKind::Other => "non-query",
        };
        f.write_str(label)
    }
}

/// Rejection raised by the policy validator. The first violation found during
/// the walk wins; violations are never collected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("SQL syntax error: {0}")]
    Syntax(String),
    #[error("{count} statements supplied; exactly one is allowed")]
    MultiStatement { count: usize },
    #[error("{kind} statements are not allowed in read-only mode")]
    WriteOperation { kind: WriteKind },
    #[error("access to table '{table}' is blocked")]
    BlacklistedTable { table: String },
    #[error("use of function '{function}' is forbidden")]
    ForbiddenFunction { function: String },
    #[error("join on '{relation}' lacks a usable ON or USING constraint")]
    UnsafeJoin { relation: String },
    #[error("{count} comma-separated tables in FROM; use an explicit JOIN with a condition")]
    MultiTableFrom { count: usize },
    #[error("reference to system variable or metadata '{name}' is not allowed")]
    SystemVariableAccess { name: String },
}

impl ValidateError {
    pub fn kind(&self) -> RejectKind {
        match self {
            ValidateError::Syntax(_) => RejectKind::Syntax,
            ValidateError::MultiStatement { .. } => RejectKind::MultiStatement,
            ValidateError::WriteOperation { .. } => RejectKind::WriteOperation,
            ValidateError::BlacklistedTable { .. } => RejectKind::BlacklistedTable,
            ValidateError::ForbiddenFunction { .. } => RejectKind::ForbiddenFunction,
            ValidateError::UnsafeJoin { .. } => RejectKind::UnsafeJoin,
            ValidateError::MultiTableFrom { .. } => RejectKind::MultiTableFrom,
            ValidateError::SystemVariableAccess { .. } => RejectKind::SystemVariableAccess,
        }
    }
}

/// Serializable rejection payload surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectKind,
    pub message: String,
}

impl Rejection {
    pub fn new(kind: RejectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ValidateError> for Rejection {
    fn from(err: &ValidateError) -> Self {
        Rejection::new(err.kind(), err.to_string())
    }
}
