use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    ClickHouseDialect, Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use thiserror::Error;

/// SQL grammar variant targeted by a given database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
    ClickHouse,
    /// ANSI-flavored fallback for engines without a dedicated grammar in the
    /// parser; Oracle maps here.
    Generic,
}

#[derive(Debug, Clone, Error)]
#[error("unknown SQL dialect '{0}'")]
pub struct UnknownDialect(String);

impl SqlDialect {
    pub(crate) fn parser_dialect(self) -> &'static dyn Dialect {
        match self {
            SqlDialect::Postgres => &PostgreSqlDialect {},
            SqlDialect::MySql => &MySqlDialect {},
            SqlDialect::Sqlite => &SQLiteDialect {},
            SqlDialect::ClickHouse => &ClickHouseDialect {},
            SqlDialect::Generic => &GenericDialect {},
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SqlDialect::Postgres => "postgres",
            SqlDialect::MySql => "mysql",
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::ClickHouse => "clickhouse",
            SqlDialect::Generic => "generic",
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlDialect {
    type Err = UnknownDialect;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mysql" => Ok(SqlDialect::MySql),
            "sqlite" => Ok(SqlDialect::Sqlite),
            "clickhouse" => Ok(SqlDialect::ClickHouse),
            "oracle" | "generic" | "ansi" => Ok(SqlDialect::Generic),
            _ => Err(UnknownDialect(raw.to_string())),
        }
    }
}
