use std::str::FromStr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlgate_core::{validate, PolicyConfig, Rejection, SqlDialect, DEFAULT_MAX_LIMIT};
use sqlgate_exec::{GuardedExecutor, SqlExecutor};
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "sqlgatectl",
    about = "Validate and run model-generated SQL through the safety gateway"
)]
struct Cli {
    /// SQL dialect the statement was generated for.
    #[arg(long, global = true, default_value = "postgres")]
    dialect: String,
    /// JSON policy file: {"blocked_tables": [...], "forbidden_functions": [...], "max_limit": N}.
    #[arg(long, global = true)]
    policy: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a statement and print the rewritten SQL.
    Validate { sql: String },
    /// Validate a statement, execute it, and print rows as JSON.
    Query {
        sql: String,
        #[arg(long, env = "SQLGATE_DATABASE_URL")]
        database_url: String,
        /// Shorten string values beyond this many characters for display.
        #[arg(long, default_value_t = 100)]
        truncate: usize,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    blocked_tables: Vec<String>,
    #[serde(default)]
    forbidden_functions: Option<Vec<String>>,
    #[serde(default)]
    max_limit: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let dialect = SqlDialect::from_str(&cli.dialect)?;
    let config = load_policy(cli.policy.as_deref())?;

    match cli.command {
        Commands::Validate { sql } => match validate(&sql, dialect, &config) {
            Ok(rewritten) => {
                println!("{}", serde_json::to_string_pretty(&json!({ "sql": rewritten }))?);
            }
            Err(err) => reject(&Rejection::from(&err))?,
        },
        Commands::Query {
            sql,
            database_url,
            truncate,
        } => {
            let rewritten = match validate(&sql, dialect, &config) {
                Ok(rewritten) => rewritten,
                Err(err) => return reject(&Rejection::from(&err)),
            };
            info!(%rewritten, "statement validated");
            let rt = Runtime::new()?;
            rt.block_on(async {
                let executor = GuardedExecutor::connect(&database_url)
                    .await
                    .context("connect database")?;
                match executor.execute(&rewritten).await {
                    Ok(rows) => {
                        let rows: Vec<JsonValue> = rows
                            .into_iter()
                            .map(|row| JsonValue::Object(truncate_row(row, truncate)))
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                        Ok::<(), anyhow::Error>(())
                    }
                    Err(err) => reject(&err.to_rejection()),
                }
            })?;
        }
    }

    Ok(())
}

fn reject(rejection: &Rejection) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(rejection)?);
    std::process::exit(1);
}

fn load_policy(path: Option<&str>) -> anyhow::Result<PolicyConfig> {
    let Some(path) = path else {
        return Ok(PolicyConfig::default());
    };
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read policy file {path}"))?;
    let file: PolicyFile = serde_json::from_str(&raw).context("parse policy file")?;
    let max_limit = file.max_limit.unwrap_or(DEFAULT_MAX_LIMIT);
    anyhow::ensure!(max_limit > 0, "max_limit must be positive");
    let config = match file.forbidden_functions {
        Some(functions) => PolicyConfig::new(file.blocked_tables, functions, max_limit),
        None => PolicyConfig::new(
            file.blocked_tables,
            sqlgate_core::DEFAULT_FORBIDDEN_FUNCTIONS
                .iter()
                .map(|s| s.to_string()),
            max_limit,
        ),
    };
    Ok(config)
}

/// Shorten long string values for terminal display; the gateway itself never
/// truncates.
fn truncate_row(mut row: sqlgate_exec::Row, limit: usize) -> sqlgate_exec::Row {
    for value in row.values_mut() {
        if let JsonValue::String(text) = value {
            if text.chars().count() > limit {
                let mut shortened: String = text.chars().take(limit).collect();
                shortened.push_str("...");
                *value = JsonValue::String(shortened);
            }
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_only_oversized_strings() {
        let mut row = sqlgate_exec::Row::new();
        row.insert("short".to_string(), json!("abc"));
        row.insert("long".to_string(), json!("x".repeat(10)));
        row.insert("number".to_string(), json!(42));

        let row = truncate_row(row, 5);
        assert_eq!(row.get("short"), Some(&json!("abc")));
        assert_eq!(row.get("long"), Some(&json!("xxxxx...")));
        assert_eq!(row.get("number"), Some(&json!(42)));
    }
}
