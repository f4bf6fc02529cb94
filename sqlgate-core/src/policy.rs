//! Immutable policy configuration shared across validations.

use std::collections::HashSet;

/// Functions refused by default: remote execution, timing/denial-of-service,
/// file export, locking, and environment/version disclosure.
pub const DEFAULT_FORBIDDEN_FUNCTIONS: &[&str] = &[
    "sys_exec",
    "shell_exec",
    "load_file",
    "sleep",
    "benchmark",
    "into_outfile",
    "into_dumpfile",
    "user_lock",
    "release_lock",
    "get_lock",
    "master_pos_wait",
    "waitfor",
    "pg_sleep",
    "dbms_lock",
    "exec",
    "execute",
    "xp_cmdshell",
    "sp_executesql",
    "user",
    "current_user",
    "session_user",
    "database",
    "schema",
    "version",
    "connection_id",
    "last_insert_id",
];

/// Row cap applied when a query carries no LIMIT of its own.
pub const DEFAULT_MAX_LIMIT: u64 = 50;

/// Blocked tables, forbidden functions, and the row cap. Constructed once at
/// startup and never mutated; lookups are case-insensitive. Plain data, so it
/// can sit behind an `Arc` and be read from any number of tasks.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    blocked_tables: HashSet<String>,
    forbidden_functions: HashSet<String>,
    max_limit: u64,
}

impl PolicyConfig {
    /// Build a configuration from explicit sets. Names are lowercased here so
    /// every later lookup is a plain set probe.
    pub fn new<I, J>(blocked_tables: I, forbidden_functions: J, max_limit: u64) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        assert!(max_limit > 0, "max_limit must be positive");
        Self {
            blocked_tables: blocked_tables
                .into_iter()
                .map(|table| table.to_lowercase())
                .collect(),
            forbidden_functions: forbidden_functions
                .into_iter()
                .map(|function| function.to_lowercase())
                .collect(),
            max_limit,
        }
    }

    /// Default function blacklist and row cap with the given blocked tables.
    pub fn with_blocked_tables<I>(blocked_tables: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self::new(
            blocked_tables,
            DEFAULT_FORBIDDEN_FUNCTIONS.iter().map(|s| s.to_string()),
            DEFAULT_MAX_LIMIT,
        )
    }

    pub fn max_limit(&self) -> u64 {
        self.max_limit
    }

    pub fn is_table_blocked(&self, name: &str) -> bool {
        self.blocked_tables.contains(&name.to_lowercase())
    }

    pub fn is_function_forbidden(&self, name: &str) -> bool {
        self.forbidden_functions.contains(&name.to_lowercase())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::with_blocked_tables(Vec::new())
    }
}
