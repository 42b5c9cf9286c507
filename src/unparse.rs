//! Dialect-specific SQL rendering and translation.
//!
//! The renderer walks the parsed AST and re-emits SQL for a target dialect:
//! identifier quoting, pagination form, null-coalesce and current-timestamp
//! aliases and cast syntax all come from the target's
//! [`DialectConverter`]. Translation composes parse, optional catalog
//! validation and rendering; offline mode (no catalog) skips validation and
//! reports every identifier it could not qualify.

use crate::binder::{self, Binder};
use crate::catalog::Catalog;
use crate::dialect::{Dialect, DialectConverter, PaginationForm};
use crate::error::{EngineError, EngineResult};
use crate::parser::{parse, ParsedStatement};
use sqlparser::ast;
use tracing::debug;

/// Result of a dialect translation.
#[derive(Debug, Clone)]
pub struct Translation {
    pub sql: String,
    /// Identifiers left unqualified because no catalog was available.
    pub unresolved: Vec<String>,
}

/// Translate a SQL text between dialects.
///
/// With a catalog the query is fully validated first (online mode); without
/// one, validation is skipped and every table reference and wildcard is
/// flagged in `unresolved` (offline mode).
pub fn translate(
    sql: &str,
    from: Dialect,
    to: Dialect,
    catalog: Option<&Catalog>,
) -> EngineResult<Translation> {
    let parsed = parse(sql, Some(from))?;
    let query = match parsed {
        ParsedStatement::Query(query) => query,
        _ => {
            return Err(EngineError::Unsupported(
                "translation of non-SELECT statements".to_string(),
            ))
        }
    };

    let unresolved = match catalog {
        Some(catalog) => {
            Binder::new(catalog).bind_query(&query)?;
            Vec::new()
        }
        None => {
            let mut names = Vec::new();
            collect_unresolved_query(&query, &mut names);
            names
        }
    };

    let rendered = render_query(&query, to)?;
    debug!(%from, %to, unresolved = unresolved.len(), "translated statement");
    Ok(Translation {
        sql: rendered,
        unresolved,
    })
}

/// Render a parsed query in the given dialect.
pub fn render_query(query: &ast::Query, dialect: Dialect) -> EngineResult<String> {
    Renderer::new(dialect).query(query)
}

struct Renderer {
    dialect: Dialect,
    converter: &'static dyn DialectConverter,
}

impl Renderer {
    fn new(dialect: Dialect) -> Self {
        Renderer {
            dialect,
            converter: dialect.converter(),
        }
    }

    fn query(&self, query: &ast::Query) -> EngineResult<String> {
        if query.with.is_some() {
            return Err(EngineError::Unsupported(
                "common table expressions".to_string(),
            ));
        }

        let (mut limit, offset) = binder::extract_pagination(query)?;
        if let ast::SetExpr::Select(select) = query.body.as_ref() {
            if let Some(top) = binder::top_quantity(select)? {
                limit = Some(top);
            }
        }
        let offset = if offset > 0 { Some(offset) } else { None };
        let mut pagination = self.converter.pagination(limit, offset);

        // TOP attaches to a SELECT keyword; a set-operation body needs the
        // trailing form instead.
        if matches!(pagination, Some(PaginationForm::SelectTop(_)))
            && !matches!(query.body.as_ref(), ast::SetExpr::Select(_))
        {
            pagination = self.converter.pagination(limit, Some(0));
        }

        let top_clause = match &pagination {
            Some(PaginationForm::SelectTop(clause)) => Some(clause.as_str()),
            _ => None,
        };

        let mut sql = self.set_expr(&query.body, top_clause)?;

        if let Some(order_by) = &query.order_by {
            let rendered = self.order_by(order_by)?;
            if !rendered.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&rendered);
            }
        }

        match pagination {
            None | Some(PaginationForm::SelectTop(_)) => {}
            Some(PaginationForm::Trailing(clause)) => {
                sql.push(' ');
                sql.push_str(&clause);
            }
            Some(PaginationForm::RownumWrapper { limit, offset }) => {
                sql = rownum_wrap(&sql, limit, offset);
            }
        }

        Ok(sql)
    }

    fn set_expr(&self, body: &ast::SetExpr, top_clause: Option<&str>) -> EngineResult<String> {
        match body {
            ast::SetExpr::Select(select) => self.select(select, top_clause),
            ast::SetExpr::Query(query) => Ok(format!("({})", self.query(query)?)),
            ast::SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => {
                let keyword = match op {
                    ast::SetOperator::Union => "UNION",
                    other => {
                        return Err(EngineError::Unsupported(format!(
                            "{other} set operations"
                        )))
                    }
                };
                let quantifier = match set_quantifier {
                    ast::SetQuantifier::All => " ALL",
                    _ => "",
                };
                Ok(format!(
                    "{} {keyword}{quantifier} {}",
                    self.set_expr(left, None)?,
                    self.set_expr(right, None)?
                ))
            }
            ast::SetExpr::Values(values) => {
                let rows = values
                    .rows
                    .iter()
                    .map(|row| {
                        Ok(format!(
                            "({})",
                            row.iter()
                                .map(|e| self.expr(e))
                                .collect::<EngineResult<Vec<_>>>()?
                                .join(", ")
                        ))
                    })
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(format!("VALUES {}", rows.join(", ")))
            }
            other => Err(EngineError::Unsupported(format!(
                "query body {other}"
            ))),
        }
    }

    fn select(&self, select: &ast::Select, top_clause: Option<&str>) -> EngineResult<String> {
        let mut sql = String::from("SELECT ");
        if let Some(top) = top_clause {
            sql.push_str(top);
            sql.push(' ');
        }
        if select.distinct.is_some() {
            sql.push_str("DISTINCT ");
        }

        let items = select
            .projection
            .iter()
            .map(|item| self.select_item(item))
            .collect::<EngineResult<Vec<_>>>()?;
        sql.push_str(&items.join(", "));

        if let Some(table) = select.from.first() {
            if select.from.len() > 1 {
                return Err(EngineError::Unsupported(
                    "comma-separated FROM lists".to_string(),
                ));
            }
            sql.push_str(" FROM ");
            sql.push_str(&self.table_with_joins(table)?);
        }

        if let Some(selection) = &select.selection {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(selection)?);
        }

        if let ast::GroupByExpr::Expressions(exprs, _) = &select.group_by {
            if !exprs.is_empty() {
                sql.push_str(" GROUP BY ");
                let rendered = exprs
                    .iter()
                    .map(|e| self.expr(e))
                    .collect::<EngineResult<Vec<_>>>()?;
                sql.push_str(&rendered.join(", "));
            }
        }

        if let Some(having) = &select.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.expr(having)?);
        }

        Ok(sql)
    }

    fn select_item(&self, item: &ast::SelectItem) -> EngineResult<String> {
        match item {
            ast::SelectItem::Wildcard(_) => Ok("*".to_string()),
            ast::SelectItem::QualifiedWildcard(kind, _) => {
                let raw = kind.to_string();
                let qualifier = raw.trim_end_matches('*').trim_end_matches('.');
                let quoted: Vec<String> = qualifier
                    .split('.')
                    .map(|part| self.quote_raw(part))
                    .collect();
                Ok(format!("{}.*", quoted.join(".")))
            }
            ast::SelectItem::UnnamedExpr(expr) => self.expr(expr),
            ast::SelectItem::ExprWithAlias { expr, alias } => Ok(format!(
                "{} AS {}",
                self.expr(expr)?,
                self.converter.quote_identifier(&alias.value)
            )),
        }
    }

    fn table_with_joins(&self, table: &ast::TableWithJoins) -> EngineResult<String> {
        let mut sql = self.table_factor(&table.relation)?;
        for join in &table.joins {
            let (keyword, constraint) = match &join.join_operator {
                ast::JoinOperator::Join(c) | ast::JoinOperator::Inner(c) => ("JOIN", Some(c)),
                ast::JoinOperator::Left(c) | ast::JoinOperator::LeftOuter(c) => {
                    ("LEFT JOIN", Some(c))
                }
                ast::JoinOperator::Right(c) | ast::JoinOperator::RightOuter(c) => {
                    ("RIGHT JOIN", Some(c))
                }
                ast::JoinOperator::FullOuter(c) => ("FULL JOIN", Some(c)),
                ast::JoinOperator::Semi(c) | ast::JoinOperator::LeftSemi(c) => {
                    ("SEMI JOIN", Some(c))
                }
                ast::JoinOperator::CrossJoin(_) => ("CROSS JOIN", None),
                ast::JoinOperator::StraightJoin(c) => {
                    // Only MySQL understands STRAIGHT_JOIN; elsewhere it
                    // degrades to a plain inner join.
                    if self.dialect == Dialect::MySql {
                        ("STRAIGHT_JOIN", Some(c))
                    } else {
                        ("JOIN", Some(c))
                    }
                }
                other => {
                    return Err(EngineError::Unsupported(format!(
                        "join operator {other:?}"
                    )))
                }
            };
            sql.push(' ');
            sql.push_str(keyword);
            sql.push(' ');
            sql.push_str(&self.table_factor(&join.relation)?);
            match constraint {
                Some(ast::JoinConstraint::On(expr)) => {
                    sql.push_str(" ON ");
                    sql.push_str(&self.expr(expr)?);
                }
                Some(ast::JoinConstraint::Using(names)) => {
                    let cols: Vec<String> = names
                        .iter()
                        .map(|n| {
                            binder::object_name_parts(n)
                                .last()
                                .map(|p| self.converter.quote_identifier(p))
                                .unwrap_or_default()
                        })
                        .collect();
                    sql.push_str(&format!(" USING ({})", cols.join(", ")));
                }
                Some(ast::JoinConstraint::Natural) => {
                    return Err(EngineError::Unsupported("NATURAL joins".to_string()))
                }
                Some(ast::JoinConstraint::None) | None => {}
            }
        }
        Ok(sql)
    }

    fn table_factor(&self, factor: &ast::TableFactor) -> EngineResult<String> {
        match factor {
            ast::TableFactor::Table { name, alias, .. } => {
                let parts: Vec<String> = binder::object_name_parts(name)
                    .iter()
                    .map(|p| self.converter.quote_identifier(p))
                    .collect();
                let mut sql = parts.join(".");
                if let Some(alias) = alias {
                    sql.push_str(&self.alias_clause(&alias.name.value));
                }
                Ok(sql)
            }
            ast::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let mut sql = format!("({})", self.query(subquery)?);
                if let Some(alias) = alias {
                    sql.push_str(&self.alias_clause(&alias.name.value));
                }
                Ok(sql)
            }
            ast::TableFactor::NestedJoin {
                table_with_joins, ..
            } => Ok(format!("({})", self.table_with_joins(table_with_joins)?)),
            other => Err(EngineError::Unsupported(format!(
                "table factor {other}"
            ))),
        }
    }

    fn alias_clause(&self, alias: &str) -> String {
        // Oracle rejects AS between a table and its alias.
        if self.dialect == Dialect::Oracle {
            format!(" {}", self.converter.quote_identifier(alias))
        } else {
            format!(" AS {}", self.converter.quote_identifier(alias))
        }
    }

    fn order_by(&self, order_by: &ast::OrderBy) -> EngineResult<String> {
        let exprs = match &order_by.kind {
            ast::OrderByKind::Expressions(exprs) => exprs,
            ast::OrderByKind::All(_) => {
                return Err(EngineError::Unsupported("ORDER BY ALL".to_string()))
            }
        };
        let mut rendered = Vec::with_capacity(exprs.len());
        for item in exprs {
            let mut part = self.expr(&item.expr)?;
            match item.options.asc {
                Some(true) => part.push_str(" ASC"),
                Some(false) => part.push_str(" DESC"),
                None => {}
            }
            if let Some(nulls_first) = item.options.nulls_first {
                // Only PostgreSQL and Oracle accept an explicit NULLS clause.
                if matches!(self.dialect, Dialect::PostgreSql | Dialect::Oracle) {
                    part.push_str(if nulls_first {
                        " NULLS FIRST"
                    } else {
                        " NULLS LAST"
                    });
                }
            }
            rendered.push(part);
        }
        Ok(rendered.join(", "))
    }

    fn expr(&self, expr: &ast::Expr) -> EngineResult<String> {
        match expr {
            ast::Expr::Identifier(ident) => Ok(self.quote_ident(ident)),
            ast::Expr::CompoundIdentifier(idents) => Ok(idents
                .iter()
                .map(|i| self.quote_ident(i))
                .collect::<Vec<_>>()
                .join(".")),
            ast::Expr::Value(value) => self.literal(&value.value),
            ast::Expr::BinaryOp { left, op, right } => {
                let left_sql = self.operand(left, op, false)?;
                let right_sql = self.operand(right, op, true)?;
                Ok(format!("{left_sql} {op} {right_sql}"))
            }
            ast::Expr::UnaryOp { op, expr } => {
                let inner = self.expr(expr)?;
                Ok(match op {
                    ast::UnaryOperator::Not => format!("NOT {inner}"),
                    ast::UnaryOperator::Minus => format!("-{inner}"),
                    ast::UnaryOperator::Plus => inner,
                    other => {
                        return Err(EngineError::Unsupported(format!(
                            "unary operator {other}"
                        )))
                    }
                })
            }
            ast::Expr::IsNull(inner) => Ok(format!("{} IS NULL", self.expr(inner)?)),
            ast::Expr::IsNotNull(inner) => Ok(format!("{} IS NOT NULL", self.expr(inner)?)),
            ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Ok(format!(
                "{} {}LIKE {}",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.expr(pattern)?
            )),
            ast::Expr::ILike {
                negated,
                expr,
                pattern,
                ..
            } => {
                if self.dialect == Dialect::PostgreSql {
                    Ok(format!(
                        "{} {}ILIKE {}",
                        self.expr(expr)?,
                        if *negated { "NOT " } else { "" },
                        self.expr(pattern)?
                    ))
                } else {
                    Ok(format!(
                        "LOWER({}) {}LIKE LOWER({})",
                        self.expr(expr)?,
                        if *negated { "NOT " } else { "" },
                        self.expr(pattern)?
                    ))
                }
            }
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(format!(
                "{} {}BETWEEN {} AND {}",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.expr(low)?,
                self.expr(high)?
            )),
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items = list
                    .iter()
                    .map(|e| self.expr(e))
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(format!(
                    "{} {}IN ({})",
                    self.expr(expr)?,
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                ))
            }
            ast::Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Ok(format!(
                "{} {}IN ({})",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" },
                self.query(subquery)?
            )),
            ast::Expr::Exists { subquery, negated } => Ok(format!(
                "{}EXISTS ({})",
                if *negated { "NOT " } else { "" },
                self.query(subquery)?
            )),
            ast::Expr::Subquery(subquery) => Ok(format!("({})", self.query(subquery)?)),
            ast::Expr::Cast {
                expr, data_type, ..
            } => {
                let inner = self.expr(expr)?;
                match binder::map_ast_type(data_type) {
                    Ok(logical) => Ok(self.converter.unparse_cast(&inner, logical)),
                    // A type outside the engine set passes through verbatim.
                    Err(_) => Ok(format!("CAST({inner} AS {data_type})")),
                }
            }
            ast::Expr::Nested(inner) => Ok(format!("({})", self.expr(inner)?)),
            ast::Expr::Function(func) => self.function(func),
            ast::Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                let mut sql = String::from("CASE");
                if let Some(operand) = operand {
                    sql.push(' ');
                    sql.push_str(&self.expr(operand)?);
                }
                for case_when in conditions {
                    sql.push_str(" WHEN ");
                    sql.push_str(&self.expr(&case_when.condition)?);
                    sql.push_str(" THEN ");
                    sql.push_str(&self.expr(&case_when.result)?);
                }
                if let Some(else_result) = else_result {
                    sql.push_str(" ELSE ");
                    sql.push_str(&self.expr(else_result)?);
                }
                sql.push_str(" END");
                Ok(sql)
            }
            ast::Expr::TypedString(ast::TypedString { data_type, value, .. }) => {
                let raw = match &value.value {
                    ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                        s.clone()
                    }
                    other => other.to_string(),
                };
                let literal = format!("'{}'", escape_string(&raw));
                match binder::map_ast_type(data_type) {
                    Ok(logical) => Ok(self.converter.unparse_cast(&literal, logical)),
                    Err(_) => Ok(format!("CAST({literal} AS {data_type})")),
                }
            }
            other => Err(EngineError::Unsupported(format!(
                "expression {other}"
            ))),
        }
    }

    fn function(&self, func: &ast::Function) -> EngineResult<String> {
        let name = binder::object_name_parts(&func.name)
            .last()
            .cloned()
            .unwrap_or_default()
            .to_uppercase();

        let args: Vec<&ast::Expr> = match &func.args {
            ast::FunctionArguments::None => Vec::new(),
            ast::FunctionArguments::List(list) => {
                let mut out = Vec::new();
                for arg in &list.args {
                    match arg {
                        ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => out.push(e),
                        ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => {
                            return Ok(format!("{name}(*)"));
                        }
                        other => {
                            return Err(EngineError::Unsupported(format!(
                                "function argument {other}"
                            )))
                        }
                    }
                }
                out
            }
            ast::FunctionArguments::Subquery(_) => {
                return Err(EngineError::Unsupported(
                    "subquery function arguments".to_string(),
                ))
            }
        };

        // Dialect function aliases.
        match name.as_str() {
            "NOW" | "CURRENT_TIMESTAMP" | "GETDATE" | "SYSDATE" if args.is_empty() => {
                return Ok(self.converter.now_function().to_string());
            }
            "COALESCE" | "IFNULL" | "NVL" | "ISNULL" if args.len() == 2 => {
                let rendered = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<EngineResult<Vec<_>>>()?;
                return Ok(format!(
                    "{}({})",
                    self.converter.coalesce_function(),
                    rendered.join(", ")
                ));
            }
            // Variadic null-coalescing is COALESCE everywhere.
            "COALESCE" | "IFNULL" | "NVL" | "ISNULL" => {
                let rendered = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<EngineResult<Vec<_>>>()?;
                return Ok(format!("COALESCE({})", rendered.join(", ")));
            }
            _ => {}
        }

        let rendered = args
            .iter()
            .map(|a| self.expr(a))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(format!("{name}({})", rendered.join(", ")))
    }

    fn literal(&self, value: &ast::Value) -> EngineResult<String> {
        Ok(match value {
            ast::Value::Number(text, _) => text.clone(),
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                format!("'{}'", escape_string(s))
            }
            ast::Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            ast::Value::Null => "NULL".to_string(),
            other => {
                return Err(EngineError::Unsupported(format!("literal {other}")))
            }
        })
    }

    /// Render a binary operand, parenthesising where operator precedence
    /// would otherwise regroup it.
    fn operand(
        &self,
        expr: &ast::Expr,
        parent: &ast::BinaryOperator,
        is_right: bool,
    ) -> EngineResult<String> {
        let rendered = self.expr(expr)?;
        if let ast::Expr::BinaryOp { op: child, .. } = expr {
            let parent_prec = precedence(parent);
            let child_prec = precedence(child);
            let non_associative = matches!(
                parent,
                ast::BinaryOperator::Minus
                    | ast::BinaryOperator::Divide
                    | ast::BinaryOperator::Modulo
            );
            if child_prec < parent_prec || (child_prec == parent_prec && is_right && non_associative)
            {
                return Ok(format!("({rendered})"));
            }
        }
        Ok(rendered)
    }

    fn quote_ident(&self, ident: &ast::Ident) -> String {
        self.converter.quote_identifier(&ident.value)
    }

    fn quote_raw(&self, raw: &str) -> String {
        let stripped = raw.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']');
        self.converter.quote_identifier(stripped)
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

fn precedence(op: &ast::BinaryOperator) -> u8 {
    match op {
        ast::BinaryOperator::Or => 1,
        ast::BinaryOperator::And => 2,
        ast::BinaryOperator::Eq
        | ast::BinaryOperator::NotEq
        | ast::BinaryOperator::Lt
        | ast::BinaryOperator::LtEq
        | ast::BinaryOperator::Gt
        | ast::BinaryOperator::GtEq => 3,
        ast::BinaryOperator::Plus | ast::BinaryOperator::Minus => 4,
        ast::BinaryOperator::Multiply
        | ast::BinaryOperator::Divide
        | ast::BinaryOperator::Modulo => 5,
        _ => 6,
    }
}

/// Classic two-level ROWNUM pagination wrapper.
fn rownum_wrap(inner: &str, limit: Option<u64>, offset: u64) -> String {
    match (limit, offset) {
        (Some(n), 0) => format!("SELECT * FROM ({inner}) WHERE ROWNUM <= {n}"),
        (Some(n), m) => format!(
            "SELECT * FROM (SELECT inner_q.*, ROWNUM rnum FROM ({inner}) inner_q \
             WHERE ROWNUM <= {}) WHERE rnum > {m}",
            n + m
        ),
        (None, m) => format!(
            "SELECT * FROM (SELECT inner_q.*, ROWNUM rnum FROM ({inner}) inner_q) \
             WHERE rnum > {m}"
        ),
        (None, 0) => inner.to_string(),
    }
}

fn collect_unresolved_query(query: &ast::Query, out: &mut Vec<String>) {
    collect_unresolved_set_expr(&query.body, out);
}

fn collect_unresolved_set_expr(body: &ast::SetExpr, out: &mut Vec<String>) {
    match body {
        ast::SetExpr::Select(select) => {
            for item in &select.projection {
                match item {
                    ast::SelectItem::Wildcard(_) => out.push("*".to_string()),
                    ast::SelectItem::QualifiedWildcard(kind, _) => out.push(kind.to_string()),
                    _ => {}
                }
            }
            for table in &select.from {
                collect_unresolved_factor(&table.relation, out);
                for join in &table.joins {
                    collect_unresolved_factor(&join.relation, out);
                }
            }
        }
        ast::SetExpr::Query(query) => collect_unresolved_query(query, out),
        ast::SetExpr::SetOperation { left, right, .. } => {
            collect_unresolved_set_expr(left, out);
            collect_unresolved_set_expr(right, out);
        }
        _ => {}
    }
}

fn collect_unresolved_factor(factor: &ast::TableFactor, out: &mut Vec<String>) {
    match factor {
        ast::TableFactor::Table { name, .. } => {
            out.push(binder::object_name_parts(name).join("."));
        }
        ast::TableFactor::Derived { subquery, .. } => collect_unresolved_query(subquery, out),
        ast::TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_unresolved_factor(&table_with_joins.relation, out);
            for join in &table_with_joins.joins {
                collect_unresolved_factor(&join.relation, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use rstest::rstest;

    fn offline(sql: &str, from: Dialect, to: Dialect) -> Translation {
        translate(sql, from, to, None).unwrap()
    }

    #[test]
    fn mysql_to_postgres_pagination() {
        let t = offline(
            "SELECT * FROM users LIMIT 10 OFFSET 5",
            Dialect::MySql,
            Dialect::PostgreSql,
        );
        assert_eq!(t.sql, "SELECT * FROM \"users\" LIMIT 10 OFFSET 5");
        assert_eq!(t.unresolved, vec!["*".to_string(), "users".to_string()]);
    }

    #[test]
    fn mysql_to_oracle_rownum_wrap() {
        let t = offline(
            "SELECT * FROM users LIMIT 10 OFFSET 5",
            Dialect::MySql,
            Dialect::Oracle,
        );
        assert!(t.sql.contains("ROWNUM <= 15"), "{}", t.sql);
        assert!(t.sql.contains("rnum > 5"), "{}", t.sql);
        assert!(t.sql.contains("\"users\""), "{}", t.sql);
    }

    #[test]
    fn mysql_to_sqlserver_top() {
        let t = offline(
            "SELECT id FROM users LIMIT 3",
            Dialect::MySql,
            Dialect::SqlServer,
        );
        assert_eq!(t.sql, "SELECT TOP 3 [id] FROM [users]");
    }

    #[test]
    fn sqlserver_offset_fetch_form() {
        let t = offline(
            "SELECT id FROM users LIMIT 3 OFFSET 4",
            Dialect::MySql,
            Dialect::SqlServer,
        );
        assert_eq!(
            t.sql,
            "SELECT [id] FROM [users] OFFSET 4 ROWS FETCH NEXT 3 ROWS ONLY"
        );
    }

    #[rstest]
    #[case(Dialect::MySql, "IFNULL(`a`, 'x')")]
    #[case(Dialect::PostgreSql, "COALESCE(\"a\", 'x')")]
    #[case(Dialect::Oracle, "NVL(\"a\", 'x')")]
    #[case(Dialect::SqlServer, "ISNULL([a], 'x')")]
    #[case(Dialect::Hive, "COALESCE(`a`, 'x')")]
    fn coalesce_aliases(#[case] to: Dialect, #[case] expected: &str) {
        let t = offline("SELECT COALESCE(a, 'x') FROM t", Dialect::MySql, to);
        assert!(t.sql.contains(expected), "{}", t.sql);
    }

    #[rstest]
    #[case(Dialect::MySql, "NOW()")]
    #[case(Dialect::PostgreSql, "CURRENT_TIMESTAMP")]
    #[case(Dialect::Oracle, "SYSDATE")]
    #[case(Dialect::SqlServer, "GETDATE()")]
    fn now_aliases(#[case] to: Dialect, #[case] expected: &str) {
        let t = offline("SELECT NOW()", Dialect::MySql, to);
        assert!(t.sql.contains(expected), "{}", t.sql);
    }

    #[test]
    fn cast_syntax_per_dialect() {
        let t = offline(
            "SELECT CAST(x AS BIGINT) FROM t",
            Dialect::MySql,
            Dialect::PostgreSql,
        );
        assert!(t.sql.contains("\"x\"::BIGINT"), "{}", t.sql);

        let back = offline(
            "SELECT x::BIGINT FROM t",
            Dialect::PostgreSql,
            Dialect::MySql,
        );
        assert!(back.sql.contains("CAST(`x` AS SIGNED)"), "{}", back.sql);
    }

    #[test]
    fn join_renders_with_quoting() {
        let t = offline(
            "SELECT o.id FROM orders o JOIN logs l ON o.id = l.order_id WHERE o.status = 'done'",
            Dialect::MySql,
            Dialect::PostgreSql,
        );
        assert_eq!(
            t.sql,
            "SELECT \"o\".\"id\" FROM \"orders\" AS \"o\" JOIN \"logs\" AS \"l\" \
             ON \"o\".\"id\" = \"l\".\"order_id\" WHERE \"o\".\"status\" = 'done'"
        );
    }

    #[test]
    fn oracle_alias_without_as() {
        let t = offline(
            "SELECT o.id FROM orders o",
            Dialect::MySql,
            Dialect::Oracle,
        );
        assert_eq!(t.sql, "SELECT \"o\".\"id\" FROM \"orders\" \"o\"");
    }

    #[test]
    fn rendering_is_stable_through_reparse() {
        let inputs = [
            "SELECT a, b FROM t WHERE a > 1 ORDER BY b DESC LIMIT 3",
            "SELECT DISTINCT status FROM orders",
            "SELECT COUNT(*) FROM t GROUP BY a HAVING COUNT(*) > 2",
            "SELECT a FROM t UNION ALL SELECT b FROM u",
            "SELECT CASE WHEN a > 1 THEN 'x' ELSE 'y' END FROM t",
        ];
        for sql in inputs {
            let once = offline(sql, Dialect::MySql, Dialect::PostgreSql).sql;
            let twice = offline(&once, Dialect::PostgreSql, Dialect::PostgreSql).sql;
            assert_eq!(once, twice, "unstable rendering for {sql}");
        }
    }

    #[test]
    fn online_translation_validates_against_catalog() {
        let catalog = federated_catalog();
        let ok = translate(
            "SELECT id FROM mysql_db.orders WHERE status = 'done'",
            Dialect::MySql,
            Dialect::PostgreSql,
            Some(&catalog),
        )
        .unwrap();
        assert!(ok.unresolved.is_empty());

        let err = translate(
            "SELECT missing FROM mysql_db.orders",
            Dialect::MySql,
            Dialect::PostgreSql,
            Some(&catalog),
        )
        .unwrap_err();
        assert_eq!(err.code(), 1002);
    }

    #[test]
    fn precedence_preserved_with_parens() {
        let t = offline(
            "SELECT * FROM t WHERE (a = 1 OR b = 2) AND c = 3",
            Dialect::MySql,
            Dialect::PostgreSql,
        );
        assert!(
            t.sql.contains("(\"a\" = 1 OR \"b\" = 2) AND \"c\" = 3"),
            "{}",
            t.sql
        );
    }

    #[test]
    fn string_literals_escaped() {
        let t = offline(
            "SELECT * FROM t WHERE a = 'it''s'",
            Dialect::MySql,
            Dialect::PostgreSql,
        );
        assert!(t.sql.contains("'it''s'"), "{}", t.sql);
    }

    #[test]
    fn dml_translation_is_unsupported() {
        let err = translate(
            "DELETE FROM t WHERE id = 1",
            Dialect::MySql,
            Dialect::PostgreSql,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}
