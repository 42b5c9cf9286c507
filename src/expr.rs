//! Bound scalar and aggregate expressions.
//!
//! After validation every column reference is an ordinal into the input row
//! type; evaluation is a straight walk over [`Value`]s with SQL three-valued
//! logic. The same tree unparses back to dialect SQL for pushdown.

use crate::error::{EngineError, EngineResult};
use crate::logical::LogicalPlan;
use crate::types::{LogicalType, Row, Schema, Value};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BinaryOp {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "<>")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    LtEq,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    GtEq,
    #[strum(serialize = "AND")]
    And,
    #[strum(serialize = "OR")]
    Or,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "%")]
    Modulo,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Built-in scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ScalarFunction {
    Coalesce,
    Now,
    Upper,
    Lower,
    Length,
    Abs,
    Round,
    Concat,
}

/// A bound scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// Ordinal into the input row; the name survives for display and unparse.
    Column { index: usize, name: String },
    Literal(Value),
    Binary {
        left: Box<ScalarExpr>,
        op: BinaryOp,
        right: Box<ScalarExpr>,
    },
    Not(Box<ScalarExpr>),
    Negate(Box<ScalarExpr>),
    IsNull {
        expr: Box<ScalarExpr>,
        negated: bool,
    },
    Like {
        expr: Box<ScalarExpr>,
        pattern: Box<ScalarExpr>,
        negated: bool,
    },
    InList {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    Cast {
        expr: Box<ScalarExpr>,
        target: LogicalType,
    },
    Function {
        func: ScalarFunction,
        args: Vec<ScalarExpr>,
    },
    Case {
        branches: Vec<(ScalarExpr, ScalarExpr)>,
        else_expr: Option<Box<ScalarExpr>>,
    },
    /// Column of the enclosing query, seen from inside a correlated
    /// subquery. Only valid until the subquery-rewrite rule runs.
    OuterColumn { index: usize, name: String },
    Exists {
        subquery: Arc<LogicalPlan>,
        negated: bool,
    },
    InSubquery {
        expr: Box<ScalarExpr>,
        subquery: Arc<LogicalPlan>,
        negated: bool,
    },
    ScalarSubquery(Arc<LogicalPlan>),
}

impl ScalarExpr {
    pub fn column(index: usize, name: impl Into<String>) -> Self {
        ScalarExpr::Column {
            index,
            name: name.into(),
        }
    }

    pub fn literal(value: Value) -> Self {
        ScalarExpr::Literal(value)
    }

    pub fn binary(left: ScalarExpr, op: BinaryOp, right: ScalarExpr) -> Self {
        ScalarExpr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Ordinals of every column this expression touches.
    pub fn columns_used(&self, acc: &mut BTreeSet<usize>) {
        match self {
            ScalarExpr::Column { index, .. } => {
                acc.insert(*index);
            }
            ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.columns_used(acc);
                right.columns_used(acc);
            }
            ScalarExpr::Not(e) | ScalarExpr::Negate(e) => e.columns_used(acc),
            ScalarExpr::IsNull { expr, .. } => expr.columns_used(acc),
            ScalarExpr::Like { expr, pattern, .. } => {
                expr.columns_used(acc);
                pattern.columns_used(acc);
            }
            ScalarExpr::InList { expr, list, .. } => {
                expr.columns_used(acc);
                for item in list {
                    item.columns_used(acc);
                }
            }
            ScalarExpr::Cast { expr, .. } => expr.columns_used(acc),
            ScalarExpr::Function { args, .. } => {
                for arg in args {
                    arg.columns_used(acc);
                }
            }
            ScalarExpr::Case {
                branches,
                else_expr,
            } => {
                for (when, then) in branches {
                    when.columns_used(acc);
                    then.columns_used(acc);
                }
                if let Some(e) = else_expr {
                    e.columns_used(acc);
                }
            }
            // A subquery consumes whatever outer columns its correlation
            // references; those keep the outer projection alive.
            ScalarExpr::OuterColumn { .. } => {}
            ScalarExpr::Exists { subquery, .. } => subquery.outer_columns(acc),
            ScalarExpr::InSubquery { expr, subquery, .. } => {
                expr.columns_used(acc);
                subquery.outer_columns(acc);
            }
            ScalarExpr::ScalarSubquery(subquery) => subquery.outer_columns(acc),
        }
    }

    /// Outer-scope ordinals referenced by this expression (correlation).
    pub fn outer_columns_used(&self, acc: &mut BTreeSet<usize>) {
        if let ScalarExpr::OuterColumn { index, .. } = self {
            acc.insert(*index);
        }
        self.walk_children(&mut |child| child.outer_columns_used(acc));
    }

    fn walk_children(&self, f: &mut dyn FnMut(&ScalarExpr)) {
        match self {
            ScalarExpr::Column { .. }
            | ScalarExpr::OuterColumn { .. }
            | ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            ScalarExpr::Not(e) | ScalarExpr::Negate(e) => f(e),
            ScalarExpr::IsNull { expr, .. } => f(expr),
            ScalarExpr::Like { expr, pattern, .. } => {
                f(expr);
                f(pattern);
            }
            ScalarExpr::InList { expr, list, .. } => {
                f(expr);
                for item in list {
                    f(item);
                }
            }
            ScalarExpr::Cast { expr, .. } => f(expr),
            ScalarExpr::Function { args, .. } => {
                for arg in args {
                    f(arg);
                }
            }
            ScalarExpr::Case {
                branches,
                else_expr,
            } => {
                for (when, then) in branches {
                    f(when);
                    f(then);
                }
                if let Some(e) = else_expr {
                    f(e);
                }
            }
            ScalarExpr::Exists { .. } | ScalarExpr::ScalarSubquery(_) => {}
            ScalarExpr::InSubquery { expr, .. } => f(expr),
        }
    }

    /// Rewrite every column ordinal through `map`; `None` when a referenced
    /// ordinal has no image (the expression cannot move below the mapping).
    pub fn remap_columns(&self, map: &dyn Fn(usize) -> Option<usize>) -> Option<ScalarExpr> {
        Some(match self {
            ScalarExpr::Column { index, name } => ScalarExpr::Column {
                index: map(*index)?,
                name: name.clone(),
            },
            ScalarExpr::Literal(v) => ScalarExpr::Literal(v.clone()),
            ScalarExpr::Binary { left, op, right } => ScalarExpr::Binary {
                left: Box::new(left.remap_columns(map)?),
                op: *op,
                right: Box::new(right.remap_columns(map)?),
            },
            ScalarExpr::Not(e) => ScalarExpr::Not(Box::new(e.remap_columns(map)?)),
            ScalarExpr::Negate(e) => ScalarExpr::Negate(Box::new(e.remap_columns(map)?)),
            ScalarExpr::IsNull { expr, negated } => ScalarExpr::IsNull {
                expr: Box::new(expr.remap_columns(map)?),
                negated: *negated,
            },
            ScalarExpr::Like {
                expr,
                pattern,
                negated,
            } => ScalarExpr::Like {
                expr: Box::new(expr.remap_columns(map)?),
                pattern: Box::new(pattern.remap_columns(map)?),
                negated: *negated,
            },
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => ScalarExpr::InList {
                expr: Box::new(expr.remap_columns(map)?),
                list: list
                    .iter()
                    .map(|e| e.remap_columns(map))
                    .collect::<Option<Vec<_>>>()?,
                negated: *negated,
            },
            ScalarExpr::Cast { expr, target } => ScalarExpr::Cast {
                expr: Box::new(expr.remap_columns(map)?),
                target: *target,
            },
            ScalarExpr::Function { func, args } => ScalarExpr::Function {
                func: *func,
                args: args
                    .iter()
                    .map(|e| e.remap_columns(map))
                    .collect::<Option<Vec<_>>>()?,
            },
            ScalarExpr::Case {
                branches,
                else_expr,
            } => ScalarExpr::Case {
                branches: branches
                    .iter()
                    .map(|(w, t)| Some((w.remap_columns(map)?, t.remap_columns(map)?)))
                    .collect::<Option<Vec<_>>>()?,
                else_expr: match else_expr {
                    Some(e) => Some(Box::new(e.remap_columns(map)?)),
                    None => None,
                },
            },
            // Subquery variants pin their position: correlation ordinals live
            // inside the nested plan and cannot be rewritten from here.
            ScalarExpr::OuterColumn { .. }
            | ScalarExpr::Exists { .. }
            | ScalarExpr::InSubquery { .. }
            | ScalarExpr::ScalarSubquery(_) => return None,
        })
    }

    /// Output type against an input row type.
    pub fn data_type(&self, input: &Schema) -> EngineResult<LogicalType> {
        let fail = |reason: String| EngineError::Validation {
            node: "expression".to_string(),
            column: None,
            reason,
        };
        match self {
            ScalarExpr::Column { index, name } => input
                .fields
                .get(*index)
                .map(|f| f.data_type)
                .ok_or_else(|| fail(format!("column ordinal {index} ({name}) out of range"))),
            ScalarExpr::Literal(v) => Ok(v.logical_type().unwrap_or(LogicalType::String)),
            ScalarExpr::Binary { left, op, right } => {
                let lt = left.data_type(input)?;
                let rt = right.data_type(input)?;
                match op {
                    BinaryOp::And | BinaryOp::Or => Ok(LogicalType::Boolean),
                    op if op.is_comparison() => {
                        lt.comparison_type(rt).map(|_| LogicalType::Boolean).ok_or_else(|| {
                            fail(format!("cannot compare {lt} with {rt}"))
                        })
                    }
                    _ => lt.comparison_type(rt).ok_or_else(|| {
                        fail(format!("no arithmetic type for {lt} and {rt}"))
                    }),
                }
            }
            ScalarExpr::Not(_) | ScalarExpr::IsNull { .. } | ScalarExpr::Like { .. } => {
                Ok(LogicalType::Boolean)
            }
            ScalarExpr::InList { .. } => Ok(LogicalType::Boolean),
            ScalarExpr::Negate(e) => e.data_type(input),
            ScalarExpr::Cast { target, .. } => Ok(*target),
            ScalarExpr::Function { func, args } => match func {
                ScalarFunction::Coalesce => args
                    .first()
                    .map(|a| a.data_type(input))
                    .unwrap_or(Ok(LogicalType::String)),
                ScalarFunction::Now => Ok(LogicalType::Timestamp),
                ScalarFunction::Upper | ScalarFunction::Lower | ScalarFunction::Concat => {
                    Ok(LogicalType::String)
                }
                ScalarFunction::Length => Ok(LogicalType::Int64),
                ScalarFunction::Abs | ScalarFunction::Round => args
                    .first()
                    .map(|a| a.data_type(input))
                    .unwrap_or(Ok(LogicalType::Float64)),
            },
            ScalarExpr::Case {
                branches,
                else_expr,
            } => {
                if let Some((_, then)) = branches.first() {
                    then.data_type(input)
                } else if let Some(e) = else_expr {
                    e.data_type(input)
                } else {
                    Ok(LogicalType::String)
                }
            }
            ScalarExpr::OuterColumn { .. } => Err(fail(
                "outer column reference outside a subquery scope".to_string(),
            )),
            ScalarExpr::Exists { .. } | ScalarExpr::InSubquery { .. } => Ok(LogicalType::Boolean),
            ScalarExpr::ScalarSubquery(subquery) => {
                let schema = subquery.schema();
                schema
                    .fields
                    .first()
                    .map(|f| f.data_type)
                    .ok_or_else(|| fail("scalar subquery with empty select list".to_string()))
            }
        }
    }

    /// Evaluate against one row.
    pub fn evaluate(&self, row: &Row) -> EngineResult<Value> {
        match self {
            ScalarExpr::Column { index, name } => {
                row.get(*index).cloned().ok_or_else(|| EngineError::Internal(format!(
                    "row has no ordinal {index} for column {name}"
                )))
            }
            ScalarExpr::Literal(v) => Ok(v.clone()),
            ScalarExpr::Binary { left, op, right } => {
                evaluate_binary(left.evaluate(row)?, *op, || right.evaluate(row))
            }
            ScalarExpr::Not(e) => match e.evaluate(row)? {
                Value::Null => Ok(Value::Null),
                Value::Boolean(b) => Ok(Value::Boolean(!b)),
                other => Err(EngineError::Validation {
                    node: "NOT".to_string(),
                    column: None,
                    reason: format!("expected boolean, got {other}"),
                }),
            },
            ScalarExpr::Negate(e) => match e.evaluate(row)? {
                Value::Null => Ok(Value::Null),
                Value::Int32(i) => Ok(Value::Int32(-i)),
                Value::Int64(i) => Ok(Value::Int64(-i)),
                Value::Float64(f) => Ok(Value::Float64(-f)),
                Value::Decimal(d) => Ok(Value::Decimal(-d)),
                other => Err(EngineError::Validation {
                    node: "negation".to_string(),
                    column: None,
                    reason: format!("cannot negate {other}"),
                }),
            },
            ScalarExpr::IsNull { expr, negated } => {
                let isnull = expr.evaluate(row)?.is_null();
                Ok(Value::Boolean(isnull != *negated))
            }
            ScalarExpr::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = expr.evaluate(row)?;
                let pattern = pattern.evaluate(row)?;
                if value.is_null() || pattern.is_null() {
                    return Ok(Value::Null);
                }
                let matched = like_match(&value.to_string(), &pattern.to_string())?;
                Ok(Value::Boolean(matched != *negated))
            }
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let needle = expr.evaluate(row)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in list {
                    let candidate = item.evaluate(row)?;
                    if candidate.is_null() {
                        saw_null = true;
                        continue;
                    }
                    if needle.compare(&candidate) == Some(Ordering::Equal) {
                        return Ok(Value::Boolean(!*negated));
                    }
                }
                if saw_null {
                    // x IN (..., NULL) is UNKNOWN when nothing matched.
                    Ok(Value::Null)
                } else {
                    Ok(Value::Boolean(*negated))
                }
            }
            ScalarExpr::Cast { expr, target } => expr.evaluate(row)?.cast(*target),
            ScalarExpr::Function { func, args } => evaluate_function(*func, args, row),
            ScalarExpr::Case {
                branches,
                else_expr,
            } => {
                for (when, then) in branches {
                    if when.evaluate(row)?.is_true() {
                        return then.evaluate(row);
                    }
                }
                match else_expr {
                    Some(e) => e.evaluate(row),
                    None => Ok(Value::Null),
                }
            }
            ScalarExpr::OuterColumn { name, .. } => Err(EngineError::Internal(format!(
                "unresolved correlated reference to {name} at execution time"
            ))),
            ScalarExpr::Exists { .. }
            | ScalarExpr::InSubquery { .. }
            | ScalarExpr::ScalarSubquery(_) => Err(EngineError::Internal(
                "subquery expression survived optimisation".to_string(),
            )),
        }
    }
}

fn evaluate_binary(
    left: Value,
    op: BinaryOp,
    right: impl FnOnce() -> EngineResult<Value>,
) -> EngineResult<Value> {
    // AND/OR use three-valued logic with short-circuiting.
    match op {
        BinaryOp::And => {
            if matches!(left, Value::Boolean(false)) {
                return Ok(Value::Boolean(false));
            }
            let right = right()?;
            return Ok(match (left, right) {
                (_, Value::Boolean(false)) => Value::Boolean(false),
                (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
                _ => Value::Null,
            });
        }
        BinaryOp::Or => {
            if matches!(left, Value::Boolean(true)) {
                return Ok(Value::Boolean(true));
            }
            let right = right()?;
            return Ok(match (left, right) {
                (_, Value::Boolean(true)) => Value::Boolean(true),
                (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
                _ => Value::Null,
            });
        }
        _ => {}
    }

    let right = right()?;
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    if op.is_comparison() {
        let ordering = left.compare(&right).ok_or_else(|| EngineError::Validation {
            node: "comparison".to_string(),
            column: None,
            reason: format!("cannot compare {left} with {right}"),
        })?;
        let result = match op {
            BinaryOp::Eq => ordering == Ordering::Equal,
            BinaryOp::NotEq => ordering != Ordering::Equal,
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::LtEq => ordering != Ordering::Greater,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::GtEq => ordering != Ordering::Less,
            _ => unreachable!("comparison op"),
        };
        return Ok(Value::Boolean(result));
    }

    arithmetic(left, op, right)
}

fn arithmetic(left: Value, op: BinaryOp, right: Value) -> EngineResult<Value> {
    let lt = left.logical_type().unwrap_or(LogicalType::String);
    let rt = right.logical_type().unwrap_or(LogicalType::String);
    let common = lt.comparison_type(rt).ok_or_else(|| EngineError::Validation {
        node: "arithmetic".to_string(),
        column: None,
        reason: format!("no arithmetic type for {lt} and {rt}"),
    })?;
    let left = left.cast(common)?;
    let right = right.cast(common)?;

    let overflow = || EngineError::Validation {
        node: "arithmetic".to_string(),
        column: None,
        reason: "numeric overflow".to_string(),
    };
    let div_zero = || EngineError::Validation {
        node: "arithmetic".to_string(),
        column: None,
        reason: "division by zero".to_string(),
    };

    macro_rules! int_arith {
        ($a:expr, $b:expr, $wrap:path, $checked_div:ident) => {
            match op {
                BinaryOp::Plus => $a.checked_add($b).map($wrap).ok_or_else(overflow),
                BinaryOp::Minus => $a.checked_sub($b).map($wrap).ok_or_else(overflow),
                BinaryOp::Multiply => $a.checked_mul($b).map($wrap).ok_or_else(overflow),
                BinaryOp::Divide => $a.$checked_div($b).map($wrap).ok_or_else(div_zero),
                BinaryOp::Modulo => $a.checked_rem($b).map($wrap).ok_or_else(div_zero),
                _ => unreachable!("arithmetic op"),
            }
        };
    }

    match (left, right) {
        (Value::Int32(a), Value::Int32(b)) => int_arith!(a, b, Value::Int32, checked_div),
        (Value::Int64(a), Value::Int64(b)) => int_arith!(a, b, Value::Int64, checked_div),
        (Value::Float64(a), Value::Float64(b)) => Ok(Value::Float64(match op {
            BinaryOp::Plus => a + b,
            BinaryOp::Minus => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => {
                if b == 0.0 {
                    return Err(div_zero());
                }
                a / b
            }
            BinaryOp::Modulo => {
                if b == 0.0 {
                    return Err(div_zero());
                }
                a % b
            }
            _ => unreachable!("arithmetic op"),
        })),
        (Value::Decimal(a), Value::Decimal(b)) => {
            let result = match op {
                BinaryOp::Plus => a.checked_add(b),
                BinaryOp::Minus => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide => a.checked_div(b),
                BinaryOp::Modulo => a.checked_rem(b),
                _ => unreachable!("arithmetic op"),
            };
            result.map(Value::Decimal).ok_or_else(overflow)
        }
        (l, r) => Err(EngineError::Validation {
            node: "arithmetic".to_string(),
            column: None,
            reason: format!("cannot apply {op} to {l} and {r}"),
        }),
    }
}

fn evaluate_function(
    func: ScalarFunction,
    args: &[ScalarExpr],
    row: &Row,
) -> EngineResult<Value> {
    match func {
        ScalarFunction::Coalesce => {
            for arg in args {
                let v = arg.evaluate(row)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        ScalarFunction::Now => Ok(Value::Timestamp(chrono::Utc::now().naive_utc())),
        ScalarFunction::Upper | ScalarFunction::Lower => {
            let v = args
                .first()
                .map(|a| a.evaluate(row))
                .transpose()?
                .unwrap_or(Value::Null);
            if v.is_null() {
                return Ok(Value::Null);
            }
            let s = v.to_string();
            Ok(Value::String(if func == ScalarFunction::Upper {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            }))
        }
        ScalarFunction::Length => {
            let v = args
                .first()
                .map(|a| a.evaluate(row))
                .transpose()?
                .unwrap_or(Value::Null);
            if v.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Int64(v.to_string().chars().count() as i64))
        }
        ScalarFunction::Abs => {
            let v = args
                .first()
                .map(|a| a.evaluate(row))
                .transpose()?
                .unwrap_or(Value::Null);
            match v {
                Value::Null => Ok(Value::Null),
                Value::Int32(i) => Ok(Value::Int32(i.abs())),
                Value::Int64(i) => Ok(Value::Int64(i.abs())),
                Value::Float64(f) => Ok(Value::Float64(f.abs())),
                Value::Decimal(d) => Ok(Value::Decimal(d.abs())),
                other => Err(EngineError::Validation {
                    node: "ABS".to_string(),
                    column: None,
                    reason: format!("expected numeric, got {other}"),
                }),
            }
        }
        ScalarFunction::Round => {
            let v = args
                .first()
                .map(|a| a.evaluate(row))
                .transpose()?
                .unwrap_or(Value::Null);
            match v {
                Value::Null => Ok(Value::Null),
                Value::Float64(f) => Ok(Value::Float64(f.round())),
                Value::Decimal(d) => Ok(Value::Decimal(d.round())),
                v @ (Value::Int32(_) | Value::Int64(_)) => Ok(v),
                other => Err(EngineError::Validation {
                    node: "ROUND".to_string(),
                    column: None,
                    reason: format!("expected numeric, got {other}"),
                }),
            }
        }
        ScalarFunction::Concat => {
            let mut out = String::new();
            for arg in args {
                let v = arg.evaluate(row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                out.push_str(&v.to_string());
            }
            Ok(Value::String(out))
        }
    }
}

/// SQL LIKE with `%` and `_` wildcards.
pub fn like_match(value: &str, pattern: &str) -> EngineResult<bool> {
    let regex = like_to_regex(pattern)?;
    Ok(regex.is_match(value))
}

/// Translate a LIKE pattern to an anchored regex.
pub fn like_to_regex(pattern: &str) -> EngineResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| EngineError::Internal(format!("bad LIKE pattern: {e}")))
}

/// Split a predicate into its top-level AND conjuncts.
pub fn split_conjunction(expr: &ScalarExpr) -> Vec<ScalarExpr> {
    match expr {
        ScalarExpr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let mut out = split_conjunction(left);
            out.extend(split_conjunction(right));
            out
        }
        other => vec![other.clone()],
    }
}

/// Rebuild a conjunction from conjuncts; `None` for an empty list.
pub fn conjoin(conjuncts: Vec<ScalarExpr>) -> Option<ScalarExpr> {
    conjuncts
        .into_iter()
        .reduce(|acc, next| ScalarExpr::binary(acc, BinaryOp::And, next))
}

/// Aggregate functions supported by the grouping operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregate call in an Aggregate node.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub func: AggregateFunction,
    /// `None` is COUNT(*).
    pub arg: Option<ScalarExpr>,
    pub distinct: bool,
    pub output_name: String,
}

impl AggregateExpr {
    pub fn output_type(&self, input: &Schema) -> EngineResult<LogicalType> {
        match self.func {
            AggregateFunction::Count => Ok(LogicalType::Int64),
            AggregateFunction::Avg => Ok(LogicalType::Float64),
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => self
                .arg
                .as_ref()
                .map(|a| a.data_type(input))
                .unwrap_or(Ok(LogicalType::Int64)),
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Column { name, .. } => write!(f, "{name}"),
            ScalarExpr::Literal(v) => match v {
                Value::String(s) => write!(f, "'{s}'"),
                other => write!(f, "{other}"),
            },
            ScalarExpr::Binary { left, op, right } => write!(f, "({left} {op} {right})"),
            ScalarExpr::Not(e) => write!(f, "NOT {e}"),
            ScalarExpr::Negate(e) => write!(f, "-{e}"),
            ScalarExpr::IsNull { expr, negated } => {
                write!(f, "{expr} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            ScalarExpr::Like {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{expr} {}LIKE {pattern}",
                if *negated { "NOT " } else { "" }
            ),
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            ScalarExpr::Cast { expr, target } => write!(f, "CAST({expr} AS {target})"),
            ScalarExpr::Function { func, args } => {
                write!(f, "{func}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ScalarExpr::Case {
                branches,
                else_expr,
            } => {
                write!(f, "CASE")?;
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(e) = else_expr {
                    write!(f, " ELSE {e}")?;
                }
                write!(f, " END")
            }
            ScalarExpr::OuterColumn { name, .. } => write!(f, "outer.{name}"),
            ScalarExpr::Exists { negated, .. } => {
                write!(f, "{}EXISTS (<subquery>)", if *negated { "NOT " } else { "" })
            }
            ScalarExpr::InSubquery { expr, negated, .. } => write!(
                f,
                "{expr} {}IN (<subquery>)",
                if *negated { "NOT " } else { "" }
            ),
            ScalarExpr::ScalarSubquery(_) => write!(f, "(<subquery>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn col(i: usize) -> ScalarExpr {
        ScalarExpr::column(i, format!("c{i}"))
    }

    #[test]
    fn comparison_with_null_is_unknown() {
        let expr = ScalarExpr::binary(col(0), BinaryOp::Eq, ScalarExpr::literal(Value::Int32(1)));
        let result = expr.evaluate(&vec![Value::Null]).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[rstest]
    #[case(Value::Boolean(false), Value::Null, Value::Boolean(false))]
    #[case(Value::Null, Value::Boolean(false), Value::Boolean(false))]
    #[case(Value::Boolean(true), Value::Null, Value::Null)]
    #[case(Value::Boolean(true), Value::Boolean(true), Value::Boolean(true))]
    fn and_three_valued(#[case] left: Value, #[case] right: Value, #[case] expected: Value) {
        let expr = ScalarExpr::binary(col(0), BinaryOp::And, col(1));
        assert_eq!(expr.evaluate(&vec![left, right]).unwrap(), expected);
    }

    #[rstest]
    #[case(Value::Boolean(true), Value::Null, Value::Boolean(true))]
    #[case(Value::Null, Value::Boolean(true), Value::Boolean(true))]
    #[case(Value::Boolean(false), Value::Null, Value::Null)]
    fn or_three_valued(#[case] left: Value, #[case] right: Value, #[case] expected: Value) {
        let expr = ScalarExpr::binary(col(0), BinaryOp::Or, col(1));
        assert_eq!(expr.evaluate(&vec![left, right]).unwrap(), expected);
    }

    #[rstest]
    #[case("completed", "comp%", true)]
    #[case("completed", "%eted", true)]
    #[case("completed", "c_mpleted", true)]
    #[case("completed", "comp", false)]
    #[case("50% off", "50\\%%", false)] // backslash is a literal, not an escape
    fn like_wildcards(#[case] value: &str, #[case] pattern: &str, #[case] expected: bool) {
        assert_eq!(like_match(value, pattern).unwrap(), expected);
    }

    #[test]
    fn in_list_with_null_is_unknown_when_unmatched() {
        let expr = ScalarExpr::InList {
            expr: Box::new(col(0)),
            list: vec![
                ScalarExpr::literal(Value::Int32(1)),
                ScalarExpr::literal(Value::Null),
            ],
            negated: false,
        };
        assert_eq!(
            expr.evaluate(&vec![Value::Int32(2)]).unwrap(),
            Value::Null
        );
        assert_eq!(
            expr.evaluate(&vec![Value::Int32(1)]).unwrap(),
            Value::Boolean(true)
        );
    }

    #[test]
    fn conjunction_splits_and_rejoins() {
        let a = ScalarExpr::binary(col(0), BinaryOp::Eq, ScalarExpr::literal(Value::Int32(1)));
        let b = ScalarExpr::binary(col(1), BinaryOp::Gt, ScalarExpr::literal(Value::Int32(2)));
        let c = ScalarExpr::binary(col(2), BinaryOp::Lt, ScalarExpr::literal(Value::Int32(3)));
        let all = conjoin(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let split = split_conjunction(&all);
        assert_eq!(split, vec![a, b, c]);
    }

    #[test]
    fn remap_fails_when_column_has_no_image() {
        let expr = ScalarExpr::binary(col(0), BinaryOp::Eq, col(5));
        let remapped = expr.remap_columns(&|i| if i == 0 { Some(0) } else { None });
        assert!(remapped.is_none());
    }

    #[test]
    fn integer_division_by_zero_fails() {
        let expr = ScalarExpr::binary(
            ScalarExpr::literal(Value::Int64(10)),
            BinaryOp::Divide,
            ScalarExpr::literal(Value::Int64(0)),
        );
        assert!(expr.evaluate(&vec![]).is_err());
    }

    #[test]
    fn coalesce_takes_first_non_null() {
        let expr = ScalarExpr::Function {
            func: ScalarFunction::Coalesce,
            args: vec![col(0), ScalarExpr::literal(Value::String("x".into()))],
        };
        assert_eq!(
            expr.evaluate(&vec![Value::Null]).unwrap(),
            Value::String("x".into())
        );
        assert_eq!(
            expr.evaluate(&vec![Value::String("y".into())]).unwrap(),
            Value::String("y".into())
        );
    }

    #[test]
    fn string_side_coerces_in_comparison() {
        let expr = ScalarExpr::binary(
            ScalarExpr::literal(Value::String("10".into())),
            BinaryOp::Gt,
            ScalarExpr::literal(Value::Int64(9)),
        );
        assert_eq!(expr.evaluate(&vec![]).unwrap(), Value::Boolean(true));
    }
}
