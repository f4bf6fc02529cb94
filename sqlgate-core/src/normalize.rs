//! Best-effort simplification of boolean expressions before serialization.
//!
//! Runs strictly after the policy walk has accepted a statement and only
//! rewrites forms with a single defined meaning (SQL three-valued logic
//! included), so it cannot change a policy outcome. The pass is
//! all-or-nothing: on failure the caller keeps the unmodified, already
//! validated tree.

use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, Query, Select, SetExpr, Statement,
    TableFactor, TableWithJoins, UnaryOperator, Value,
};
use thiserror::Error;

/// Expression nesting deeper than this aborts the pass. The parser enforces
/// its own recursion limit above this, so anything deeper is adversarial
/// rather than organic.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub(crate) enum NormalizeError {
    #[error("expression nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
}

/// Simplify boolean scaffolding in WHERE/HAVING/ON clauses.
pub(crate) fn simplify_statement(statement: &mut Statement) -> Result<(), NormalizeError> {
    let mut candidate = statement.clone();
    if let Statement::Query(query) = &mut candidate {
        simplify_query(query)?;
    }
    *statement = candidate;
    Ok(())
}

fn simplify_query(query: &mut Query) -> Result<(), NormalizeError> {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            simplify_query(&mut cte.query)?;
        }
    }
    simplify_set_expr(&mut query.body)
}

fn simplify_set_expr(body: &mut SetExpr) -> Result<(), NormalizeError> {
    match body {
        SetExpr::Select(select) => simplify_select(select),
        SetExpr::Query(query) => simplify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            simplify_set_expr(left)?;
            simplify_set_expr(right)
        }
        _ => Ok(()),
    }
}

fn simplify_select(select: &mut Select) -> Result<(), NormalizeError> {
    if let Some(selection) = &mut select.selection {
        simplify_expr(selection, 0)?;
    }
    if let Some(having) = &mut select.having {
        simplify_expr(having, 0)?;
    }
    for table in &mut select.from {
        simplify_table_with_joins(table)?;
    }
    Ok(())
}

fn simplify_table_with_joins(table: &mut TableWithJoins) -> Result<(), NormalizeError> {
    simplify_table_factor(&mut table.relation)?;
    for join in &mut table.joins {
        simplify_join(join)?;
        simplify_table_factor(&mut join.relation)?;
    }
    Ok(())
}

fn simplify_table_factor(factor: &mut TableFactor) -> Result<(), NormalizeError> {
    match factor {
        TableFactor::Derived { subquery, .. } => simplify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => simplify_table_with_joins(table_with_joins),
        _ => Ok(()),
    }
}

fn simplify_join(join: &mut Join) -> Result<(), NormalizeError> {
    let constraint = match &mut join.join_operator {
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
    if let JoinConstraint::On(predicate) = constraint {
        simplify_expr(predicate, 0)?;
    }
    Ok(())
}

/// Bottom-up: children first, then fold the node until it no longer shrinks.
/// Only boolean scaffolding (AND/OR/NOT, parentheses, literal comparisons) is
/// descended into; everything else stays exactly as written.
fn simplify_expr(expr: &mut Expr, depth: usize) -> Result<(), NormalizeError> {
    if depth > MAX_DEPTH {
        return Err(NormalizeError::TooDeep);
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            simplify_expr(left, depth + 1)?;
            simplify_expr(right, depth + 1)?;
        }
        Expr::UnaryOp { expr: inner, .. } => simplify_expr(inner, depth + 1)?,
        Expr::Nested(inner) => simplify_expr(inner, depth + 1)?,
        _ => return Ok(()),
    }
    // Every fold strictly shrinks the node count, so this terminates.
    while let Some(folded) = fold(expr) {
        *expr = folded;
    }
    Ok(())
}

fn fold(expr: &Expr) -> Option<Expr> {
    match expr {
        // Parentheses around an atom carry no meaning.
        Expr::Nested(inner) => match inner.as_ref() {
            atom @ (Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_)) => {
                Some(atom.clone())
            }
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: inner,
        } => match strip_parens(inner) {
            Expr::Value(Value::Boolean(b)) => Some(bool_literal(!b)),
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: double,
            } => Some((**double).clone()),
            _ => None,
        },
        Expr::BinaryOp { left, op, right } => match op {
            // x AND FALSE is FALSE and x OR TRUE is TRUE even when x is
            // NULL, so all four folds are sound under three-valued logic.
            BinaryOperator::And => {
                match (as_bool(strip_parens(left)), as_bool(strip_parens(right))) {
                    (Some(true), _) => Some((**right).clone()),
                    (_, Some(true)) => Some((**left).clone()),
                    (Some(false), _) | (_, Some(false)) => Some(bool_literal(false)),
                    _ => None,
                }
            }
            BinaryOperator::Or => {
                match (as_bool(strip_parens(left)), as_bool(strip_parens(right))) {
                    (Some(false), _) => Some((**right).clone()),
                    (_, Some(false)) => Some((**left).clone()),
                    (Some(true), _) | (_, Some(true)) => Some(bool_literal(true)),
                    _ => None,
                }
            }
            BinaryOperator::Eq => match (strip_parens(left), strip_parens(right)) {
                (Expr::Value(l), Expr::Value(r)) if l == r && !matches!(l, Value::Null) => {
                    Some(bool_literal(true))
                }
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn strip_parens(expr: &Expr) -> &Expr {
    let mut current = expr;
    while let Expr::Nested(inner) = current {
        current = inner;
    }
    current
}

fn as_bool(expr: &Expr) -> Option<bool> {
    match expr {
        Expr::Value(Value::Boolean(b)) => Some(*b),
        _ => None,
    }
}

fn bool_literal(value: bool) -> Expr {
    Expr::Value(Value::Boolean(value))
}
