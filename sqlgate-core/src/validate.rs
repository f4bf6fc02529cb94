//! Policy validation and rewriting of untrusted SQL statements.
//!
//! The walk runs two kinds of checks over the parsed tree: name-based sweeps
//! (tables, functions, column references, nested statements) that use the
//! parser's derived traversal so every node of every expression is reached,
//! and structural checks (join constraints, comma-separated FROM lists) that
//! descend the query shape directly. Both fail fast on the first violation.

use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, visit_relations, visit_statements, BinaryOperator, Expr, Join,
    JoinConstraint, JoinOperator, ObjectName, Query, Select, SetExpr, Statement, TableFactor,
    TableWithJoins, Value,
};
use sqlparser::parser::Parser;
use tracing::debug;

use crate::dialect::SqlDialect;
use crate::error::{ValidateError, WriteKind};
use crate::normalize;
use crate::policy::PolicyConfig;

/// Prefix marking a session/system variable reference (`@@version`).
const SYSTEM_VARIABLE_MARKER: &str = "@@";
/// Metadata schema whose mention in a column reference is refused outright.
const SYSTEM_SCHEMA: &str = "information_schema";

/// Validate one untrusted SQL statement and rewrite it into a bounded,
/// read-only form, or reject it with the first violation found.
///
/// On success the returned SQL is a single query statement in canonical
/// textual form whose top-level LIMIT does not exceed the policy cap (unless
/// the original LIMIT was a bound parameter, which the executor caps
/// instead).
pub fn validate(
    sql: &str,
    dialect: SqlDialect,
    config: &PolicyConfig,
) -> Result<String, ValidateError> {
    let statements = Parser::parse_sql(dialect.parser_dialect(), sql)
        .map_err(|err| ValidateError::Syntax(err.to_string()))?;
    if statements.len() > 1 {
        return Err(ValidateError::MultiStatement {
            count: statements.len(),
        });
    }
    let mut statement = statements
        .into_iter()
        .next()
        .ok_or_else(|| ValidateError::Syntax("empty statement".to_string()))?;

    if !matches!(statement, Statement::Query(_)) {
        return Err(ValidateError::WriteOperation {
            kind: write_kind(&statement),
        });
    }

    check_policy(&statement, config)?;

    if let Err(err) = normalize::simplify_statement(&mut statement) {
        // Best effort only: the tree is already policy-checked, so the
        // unsimplified form is kept.
        debug!(%err, "normalization skipped");
    }

    if let Statement::Query(query) = &mut statement {
        enforce_limit(query, config.max_limit());
    }

    Ok(statement.to_string())
}

/// Run every policy check over the full statement tree.
fn check_policy(statement: &Statement, config: &PolicyConfig) -> Result<(), ValidateError> {
    flow_to_result(visit_statements(statement, |stmt| match stmt {
        Statement::Query(_) => ControlFlow::Continue(()),
        other => ControlFlow::Break(ValidateError::WriteOperation {
            kind: write_kind(other),
        }),
    }))?;

    flow_to_result(visit_relations(statement, |relation| {
        match blocked_table(relation, config) {
            Some(table) => ControlFlow::Break(ValidateError::BlacklistedTable { table }),
            None => ControlFlow::Continue(()),
        }
    }))?;

    flow_to_result(visit_expressions(statement, |expr| {
        match check_expr(expr, config) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }))?;

    if let Statement::Query(query) = statement {
        check_query(query, config)?;
    }
    Ok(())
}

fn flow_to_result(flow: ControlFlow<ValidateError>) -> Result<(), ValidateError> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(err) => Err(err),
    }
}

fn check_expr(expr: &Expr, config: &PolicyConfig) -> Result<(), ValidateError> {
    match expr {
        Expr::Function(func) => {
            let function = function_name(&func.name);
            if config.is_function_forbidden(&function) {
                return Err(ValidateError::ForbiddenFunction { function });
            }
            Ok(())
        }
        Expr::Identifier(ident) => check_column_name(&ident.value),
        Expr::CompoundIdentifier(parts) => {
            for part in parts {
                check_column_name(&part.value)?;
            }
            Ok(())
        }
        // Join and FROM rules also apply to queries reached only through
        // expressions; the structural walk is re-entered here.
        Expr::Subquery(query) | Expr::ArraySubquery(query) => check_query(query, config),
        Expr::InSubquery { subquery, .. } => check_query(subquery, config),
        Expr::Exists { subquery, .. } => check_query(subquery, config),
        _ => Ok(()),
    }
}

/// Bare function name, lowercased. Schema-qualified calls match on the final
/// segment, the same way unresolved/anonymous calls do.
fn function_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn check_column_name(name: &str) -> Result<(), ValidateError> {
    let lowered = name.to_lowercase();
    if lowered.starts_with(SYSTEM_VARIABLE_MARKER) || lowered.contains(SYSTEM_SCHEMA) {
        return Err(ValidateError::SystemVariableAccess { name: lowered });
    }
    Ok(())
}

fn blocked_table(relation: &ObjectName, config: &PolicyConfig) -> Option<String> {
    let table = relation.0.last()?.value.to_lowercase();
    config.is_table_blocked(&table).then_some(table)
}

/// Structural checks over the query shape: CTE bodies, set-operation
/// branches, derived tables, and every join along the way.
fn check_query(query: &Query, config: &PolicyConfig) -> Result<(), ValidateError> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query, config)?;
        }
    }
    check_set_expr(&query.body, config)
}

fn check_set_expr(body: &SetExpr, config: &PolicyConfig) -> Result<(), ValidateError> {
    match body {
        SetExpr::Select(select) => check_select(select, config),
        SetExpr::Query(query) => check_query(query, config),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left, config)?;
            check_set_expr(right, config)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
        // DML bodies (INSERT/UPDATE as a set expression). The statement
        // sweep already rejected their inner statement with a precise kind;
        // this arm stays fail-closed for anything it did not.
        _ => Err(ValidateError::WriteOperation {
            kind: WriteKind::Other,
        }),
    }
}

fn check_select(select: &Select, config: &PolicyConfig) -> Result<(), ValidateError> {
    if select.from.len() > 1 {
        return Err(ValidateError::MultiTableFrom {
            count: select.from.len(),
        });
    }
    for table in &select.from {
        check_table_with_joins(table, config)?;
    }
    Ok(())
}

fn check_table_with_joins(
    table: &TableWithJoins,
    config: &PolicyConfig,
) -> Result<(), ValidateError> {
    check_table_factor(&table.relation, config)?;
    for join in &table.joins {
        check_join(join)?;
        check_table_factor(&join.relation, config)?;
    }
    Ok(())
}

fn check_table_factor(factor: &TableFactor, config: &PolicyConfig) -> Result<(), ValidateError> {
    match factor {
        TableFactor::Derived { subquery, .. } => check_query(subquery, config),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => check_table_with_joins(table_with_joins, config),
        // Table names are covered by the relation sweep, expressions inside
        // UNNEST and table functions by the expression sweep.
        _ => Ok(()),
    }
}

/// A join outside CROSS/NATURAL must carry a real ON predicate or USING
/// column list; `ON 1 = 1`-style identities count as missing.
fn check_join(join: &Join) -> Result<(), ValidateError> {
    let constraint = match &join.join_operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint) => constraint,
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => {
            return Ok(())
        }
    };
    let usable = match constraint {
        JoinConstraint::On(predicate) => !is_trivial_equality(predicate),
        JoinConstraint::Using(columns) => !columns.is_empty(),
        JoinConstraint::Natural => true,
        JoinConstraint::None => false,
    };
    if usable {
        Ok(())
    } else {
        Err(ValidateError::UnsafeJoin {
            relation: relation_label(&join.relation),
        })
    }
}

fn relation_label(factor: &TableFactor) -> String {
    match factor {
        TableFactor::Table { name, .. } => name.to_string(),
        TableFactor::Derived { .. } => "subquery".to_string(),
        _ => "relation".to_string(),
    }
}

/// `lit = lit` with both sides the same non-NULL literal.
fn is_trivial_equality(predicate: &Expr) -> bool {
    match strip_parens(predicate) {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => match (strip_parens(left), strip_parens(right)) {
            (Expr::Value(l), Expr::Value(r)) => l == r && !matches!(l, Value::Null),
            _ => false,
        },
        _ => false,
    }
}

fn strip_parens(expr: &Expr) -> &Expr {
    let mut current = expr;
    while let Expr::Nested(inner) = current {
        current = inner;
    }
    current
}

fn write_kind(statement: &Statement) -> WriteKind {
    match statement {
        Statement::Insert { .. } => WriteKind::Insert,
        Statement::Update { .. } => WriteKind::Update,
        Statement::Delete { .. } => WriteKind::Delete,
        Statement::Drop { .. } | Statement::DropFunction { .. } => WriteKind::Drop,
        Statement::Merge { .. } => WriteKind::Merge,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateVirtualTable { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateRole { .. } => WriteKind::Create,
        Statement::AlterTable { .. } | Statement::AlterIndex { .. } => WriteKind::Alter,
        _ => WriteKind::Other,
    }
}

/// Clamp the top-level LIMIT to the policy cap, appending one when absent. A
/// more restrictive client limit wins; a non-literal limit (bound parameter)
/// passes through and is capped at execution time instead.
fn enforce_limit(query: &mut Query, max_limit: u64) {
    let replace = match &query.limit {
        None => true,
        Some(Expr::Value(Value::Number(value, _))) => {
            !matches!(value.parse::<u64>(), Ok(v) if v < max_limit)
        }
        Some(_) => false,
    };
    if replace {
        query.limit = Some(Expr::Value(Value::Number(max_limit.to_string(), false)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectKind;

    fn config() -> PolicyConfig {
        PolicyConfig::with_blocked_tables(vec!["users_secrets".to_string()])
    }

    fn validate_pg(sql: &str) -> Result<String, ValidateError> {
        validate(sql, SqlDialect::Postgres, &config())
    }

    #[test]
    fn appends_limit_when_absent() {
        assert_eq!(
            validate_pg("SELECT * FROM products").unwrap(),
            "SELECT * FROM products LIMIT 50"
        );
    }

    #[test]
    fn keeps_more_restrictive_limit() {
        assert_eq!(
            validate_pg("SELECT * FROM products LIMIT 10").unwrap(),
            "SELECT * FROM products LIMIT 10"
        );
    }

    #[test]
    fn clamps_oversized_limit() {
        assert_eq!(
            validate_pg("SELECT * FROM products LIMIT 1000").unwrap(),
            "SELECT * FROM products LIMIT 50"
        );
    }

    #[test]
    fn clamps_unparseable_limit_literal() {
        let rewritten =
            validate_pg("SELECT * FROM products LIMIT 99999999999999999999999999").unwrap();
        assert!(rewritten.ends_with("LIMIT 50"), "{rewritten}");
    }

    #[test]
    fn passes_through_parameter_limit() {
        let rewritten = validate_pg("SELECT * FROM products LIMIT $1").unwrap();
        assert!(rewritten.ends_with("LIMIT $1"), "{rewritten}");
    }

    #[test]
    fn subquery_limits_are_untouched() {
        let rewritten =
            validate_pg("WITH recent AS (SELECT * FROM orders LIMIT 5) SELECT * FROM recent")
                .unwrap();
        assert!(rewritten.contains("LIMIT 5"), "{rewritten}");
        assert!(rewritten.ends_with("LIMIT 50"), "{rewritten}");
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = validate_pg("SELECT 1; DROP TABLE orders").unwrap_err();
        assert_eq!(err.kind(), RejectKind::MultiStatement);
    }

    #[test]
    fn rejects_write_statements() {
        let err = validate_pg("DELETE FROM orders WHERE id = 1").unwrap_err();
        assert!(matches!(
            err,
            ValidateError::WriteOperation {
                kind: WriteKind::Delete
            }
        ));
    }

    #[test]
    fn rejects_non_query_root_statements() {
        let err = validate_pg("SHOW search_path").unwrap_err();
        assert_eq!(err.kind(), RejectKind::WriteOperation);
    }

    #[test]
    fn rejects_blocked_table_in_main_from() {
        let err = validate_pg("SELECT username, password FROM users_secrets").unwrap_err();
        assert!(
            matches!(err, ValidateError::BlacklistedTable { ref table } if table == "users_secrets")
        );
    }

    #[test]
    fn rejects_blocked_table_in_subquery() {
        let err = validate_pg("SELECT * FROM (SELECT * FROM users_secrets) AS s").unwrap_err();
        assert_eq!(err.kind(), RejectKind::BlacklistedTable);
    }

    #[test]
    fn rejects_blocked_table_in_cte() {
        let err =
            validate_pg("WITH leaked AS (SELECT * FROM users_secrets) SELECT * FROM leaked")
                .unwrap_err();
        assert_eq!(err.kind(), RejectKind::BlacklistedTable);
    }

    #[test]
    fn rejects_blocked_table_in_union_branch() {
        let err =
            validate_pg("SELECT id FROM products UNION SELECT id FROM users_secrets").unwrap_err();
        assert_eq!(err.kind(), RejectKind::BlacklistedTable);
    }

    #[test]
    fn rejects_blocked_table_in_where_subquery() {
        let err =
            validate_pg("SELECT * FROM products WHERE id IN (SELECT id FROM users_secrets)")
                .unwrap_err();
        assert_eq!(err.kind(), RejectKind::BlacklistedTable);
    }

    #[test]
    fn blocked_table_match_is_case_insensitive() {
        let err = validate_pg("SELECT * FROM Users_Secrets").unwrap_err();
        assert_eq!(err.kind(), RejectKind::BlacklistedTable);
    }

    #[test]
    fn rejects_join_without_condition() {
        let err = validate_pg("SELECT * FROM a JOIN b").unwrap_err();
        assert_eq!(err.kind(), RejectKind::UnsafeJoin);
    }

    #[test]
    fn rejects_identity_join_condition() {
        let err = validate_pg("SELECT * FROM a JOIN b ON 1 = 1").unwrap_err();
        assert_eq!(err.kind(), RejectKind::UnsafeJoin);
    }

    #[test]
    fn accepts_join_with_real_condition() {
        assert!(validate_pg("SELECT * FROM a JOIN b ON a.id = b.a_id").is_ok());
    }

    #[test]
    fn accepts_cross_and_natural_joins() {
        assert!(validate_pg("SELECT * FROM a CROSS JOIN b").is_ok());
        assert!(validate_pg("SELECT * FROM a NATURAL JOIN b").is_ok());
    }

    #[test]
    fn rejects_join_hidden_in_exists_subquery() {
        let err = validate_pg("SELECT * FROM products WHERE EXISTS (SELECT 1 FROM a JOIN b)")
            .unwrap_err();
        assert_eq!(err.kind(), RejectKind::UnsafeJoin);
    }

    #[test]
    fn rejects_comma_separated_from() {
        let err = validate_pg("SELECT * FROM a, b").unwrap_err();
        assert_eq!(err.kind(), RejectKind::MultiTableFrom);
    }

    #[test]
    fn rejects_forbidden_function() {
        let err = validate("SELECT SLEEP(5)", SqlDialect::MySql, &PolicyConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ValidateError::ForbiddenFunction { ref function } if function == "sleep"
        ));
    }

    #[test]
    fn rejects_version_disclosure_function() {
        let err = validate_pg("SELECT version()").unwrap_err();
        assert_eq!(err.kind(), RejectKind::ForbiddenFunction);
    }

    #[test]
    fn rejects_forbidden_function_in_where_clause() {
        let err = validate_pg("SELECT id FROM products WHERE pg_sleep(1) IS NULL").unwrap_err();
        assert_eq!(err.kind(), RejectKind::ForbiddenFunction);
    }

    #[test]
    fn rejects_system_variable_reference() {
        let err = validate(
            "SELECT @@version",
            SqlDialect::MySql,
            &PolicyConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), RejectKind::SystemVariableAccess);
    }

    #[test]
    fn rejects_system_metadata_reference() {
        let err =
            validate_pg("SELECT information_schema.tables.table_name FROM products").unwrap_err();
        assert_eq!(err.kind(), RejectKind::SystemVariableAccess);
    }

    #[test]
    fn rejects_nonsense_input_as_syntax_error() {
        let err = validate_pg("definitely not sql").unwrap_err();
        assert_eq!(err.kind(), RejectKind::Syntax);
    }

    #[test]
    fn empty_input_is_a_syntax_error() {
        let err = validate_pg("   ").unwrap_err();
        assert_eq!(err.kind(), RejectKind::Syntax);
    }

    #[test]
    fn validation_is_idempotent() {
        let once = validate_pg("SELECT name FROM products WHERE price > 10").unwrap();
        let twice = validate_pg(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rewritten_sql_reparses() {
        let rewritten = validate_pg(
            "WITH recent AS (SELECT * FROM orders LIMIT 5) SELECT * FROM recent",
        )
        .unwrap();
        assert!(Parser::parse_sql(SqlDialect::Postgres.parser_dialect(), &rewritten).is_ok());
    }

    #[test]
    fn simplifies_boolean_scaffolding() {
        let rewritten = validate_pg("SELECT id FROM products WHERE TRUE AND price > 10").unwrap();
        assert_eq!(rewritten, "SELECT id FROM products WHERE price > 10 LIMIT 50");
    }

    #[test]
    fn normalization_keeps_relation_set_intact() {
        let sql = "SELECT * FROM products WHERE NOT NOT (price > 10 AND TRUE)";
        let rewritten = validate_pg(sql).unwrap();
        let statements =
            Parser::parse_sql(SqlDialect::Postgres.parser_dialect(), &rewritten).unwrap();
        let mut relations = Vec::new();
        visit_relations(&statements, |relation| {
            relations.push(relation.to_string());
            ControlFlow::<()>::Continue(())
        });
        assert_eq!(relations, vec!["products".to_string()]);
        // The simplified form re-validates to the same statement.
        assert_eq!(validate_pg(&rewritten).unwrap(), rewritten);
    }
}
