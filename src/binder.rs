//! Name binding and validation.
//!
//! Turns a parsed AST into a [`LogicalPlan`] against one catalog snapshot:
//! table references resolve to exactly one catalogued table, column
//! references to exactly one ordinal, and every expression type-checks under
//! the implicit coercion rules. Comparison coercion never loses data; a
//! lossy conversion needs an explicit cast in the query text.

use crate::catalog::{Catalog, SourceKind};
use crate::error::{EngineError, EngineResult};
use crate::expr::{
    like_match, AggregateExpr, AggregateFunction, BinaryOp, ScalarExpr, ScalarFunction,
};
use crate::logical::{join_schema, JoinType, LogicalPlan, ScanNode, SortKey};
use crate::parser::ParsedStatement;
use crate::types::{Field, LogicalType, Schema, Value};
use sqlparser::ast;
use std::sync::Arc;
use tracing::debug;

/// A statement bound against the catalog, ready for the optimiser.
#[derive(Debug, Clone)]
pub enum BoundStatement {
    Select(LogicalPlan),
    Explain(LogicalPlan),
    /// Single-source DML, rewritten to source-local table names.
    Dml { source: String, sql: String },
}

pub struct Binder<'a> {
    catalog: &'a Catalog,
}

impl<'a> Binder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Binder { catalog }
    }

    pub fn bind_statement(&self, parsed: ParsedStatement) -> EngineResult<BoundStatement> {
        match parsed {
            ParsedStatement::Query(query) => Ok(BoundStatement::Select(self.bind_query(&query)?)),
            ParsedStatement::Explain(query) => {
                Ok(BoundStatement::Explain(self.bind_query(&query)?))
            }
            ParsedStatement::ShowSchemas => Ok(BoundStatement::Select(self.bind_show_schemas())),
            ParsedStatement::ShowTables { source, pattern } => Ok(BoundStatement::Select(
                self.bind_show_tables(source.as_deref(), pattern.as_deref())?,
            )),
            ParsedStatement::Dml(stmt) => self.bind_dml(*stmt),
        }
    }

    pub fn bind_query(&self, query: &ast::Query) -> EngineResult<LogicalPlan> {
        self.bind_query_scoped(query, None)
    }

    fn bind_query_scoped(
        &self,
        query: &ast::Query,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        if query.with.is_some() {
            return Err(EngineError::Unsupported(
                "common table expressions".to_string(),
            ));
        }

        let mut plan = self.bind_set_expr(&query.body, outer)?;

        if let Some(order_by) = &query.order_by {
            let keys = self.bind_order_by(order_by, &plan.schema())?;
            if !keys.is_empty() {
                plan = LogicalPlan::Sort {
                    input: Arc::new(plan),
                    keys,
                };
            }
        }

        let (limit, offset) = extract_pagination(query)?;
        if limit.is_some() || offset > 0 {
            plan = LogicalPlan::Limit {
                input: Arc::new(plan),
                limit,
                offset,
            };
        }

        Ok(plan)
    }

    fn bind_set_expr(
        &self,
        body: &ast::SetExpr,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        match body {
            ast::SetExpr::Select(select) => self.bind_select(select, outer),
            ast::SetExpr::Query(query) => self.bind_query_scoped(query, outer),
            ast::SetExpr::SetOperation {
                op: ast::SetOperator::Union,
                set_quantifier,
                left,
                right,
            } => {
                let left_plan = self.bind_set_expr(left, outer)?;
                let right_plan = self.bind_set_expr(right, outer)?;
                let left_schema = left_plan.schema();
                let right_schema = right_plan.schema();
                if left_schema.len() != right_schema.len() {
                    return Err(EngineError::Validation {
                        node: "UNION".to_string(),
                        column: None,
                        reason: format!(
                            "branches produce {} and {} columns",
                            left_schema.len(),
                            right_schema.len()
                        ),
                    });
                }
                let all = matches!(set_quantifier, ast::SetQuantifier::All);
                let plan = LogicalPlan::Union {
                    inputs: vec![Arc::new(left_plan), Arc::new(right_plan)],
                    all: true,
                    schema: left_schema.clone(),
                };
                if all {
                    Ok(plan)
                } else {
                    // UNION (distinct) groups on every output column.
                    Ok(distinct_over(plan))
                }
            }
            ast::SetExpr::SetOperation { op, .. } => {
                Err(EngineError::Unsupported(format!("{op} set operations")))
            }
            ast::SetExpr::Values(values) => self.bind_values(values),
            _ => Err(EngineError::Unsupported(
                "this query body form".to_string(),
            )),
        }
    }

    fn bind_values(&self, values: &ast::Values) -> EngineResult<LogicalPlan> {
        let empty = Schema::empty();
        let mut rows = Vec::with_capacity(values.rows.len());
        for row in &values.rows {
            let mut bound = Vec::with_capacity(row.len());
            for expr in row {
                bound.push(self.bind_expr(expr, &empty, None)?);
            }
            rows.push(bound);
        }
        let first = rows.first().ok_or_else(|| EngineError::Validation {
            node: "VALUES".to_string(),
            column: None,
            reason: "empty VALUES list".to_string(),
        })?;
        let fields = first
            .iter()
            .enumerate()
            .map(|(i, e)| {
                Ok(Field::new(
                    format!("column{}", i + 1),
                    e.data_type(&empty)?,
                    true,
                ))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(LogicalPlan::Values {
            rows,
            schema: Schema::new(fields),
        })
    }

    fn bind_select(
        &self,
        select: &ast::Select,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        if select.from.len() > 1 {
            return Err(EngineError::Unsupported(
                "comma-separated FROM lists (use explicit JOIN)".to_string(),
            ));
        }

        let mut plan = match select.from.first() {
            Some(table) => self.bind_table_with_joins(table, outer)?,
            None => LogicalPlan::Values {
                rows: vec![Vec::new()],
                schema: Schema::empty(),
            },
        };

        if let Some(selection) = &select.selection {
            let schema = plan.schema();
            let predicate = self.bind_expr(selection, &schema, outer)?;
            self.check_boolean(&predicate, &schema, "WHERE")?;
            plan = LogicalPlan::Filter {
                input: Arc::new(plan),
                predicate,
            };
        }

        let group_exprs = match &select.group_by {
            ast::GroupByExpr::Expressions(exprs, _) => exprs.clone(),
            ast::GroupByExpr::All(_) => {
                return Err(EngineError::Unsupported("GROUP BY ALL".to_string()))
            }
        };
        let has_aggregates = select
            .projection
            .iter()
            .any(|item| select_item_expr(item).map(contains_aggregate).unwrap_or(false))
            || select.having.as_ref().map(contains_aggregate).unwrap_or(false);

        if !group_exprs.is_empty() || has_aggregates {
            plan = self.bind_aggregate(plan, select, &group_exprs)?;
        } else {
            if select.having.is_some() {
                return Err(EngineError::Validation {
                    node: "HAVING".to_string(),
                    column: None,
                    reason: "HAVING requires GROUP BY or aggregates".to_string(),
                });
            }
            plan = self.bind_projection(plan, &select.projection, outer)?;
        }

        if select.distinct.is_some() {
            plan = distinct_over(plan);
        }

        // SELECT TOP n surfaces as a limit above everything bound so far.
        if let Some(n) = top_quantity(select)? {
            plan = LogicalPlan::Limit {
                input: Arc::new(plan),
                limit: Some(n),
                offset: 0,
            };
        }

        Ok(plan)
    }

    fn bind_projection(
        &self,
        input: LogicalPlan,
        projection: &[ast::SelectItem],
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        let schema = input.schema();
        let mut exprs: Vec<(ScalarExpr, String)> = Vec::new();

        for item in projection {
            match item {
                ast::SelectItem::Wildcard(_) => {
                    for (i, field) in schema.fields.iter().enumerate() {
                        exprs.push((ScalarExpr::column(i, field.name.clone()), field.name.clone()));
                    }
                }
                ast::SelectItem::QualifiedWildcard(kind, _) => {
                    let qualifier = trim_last_dot_star(&kind.to_string());
                    let mut found = false;
                    for (i, field) in schema.fields.iter().enumerate() {
                        if field
                            .qualifier
                            .as_deref()
                            .map(|q| q.eq_ignore_ascii_case(&qualifier))
                            .unwrap_or(false)
                        {
                            exprs.push((
                                ScalarExpr::column(i, field.name.clone()),
                                field.name.clone(),
                            ));
                            found = true;
                        }
                    }
                    if !found {
                        return Err(EngineError::Validation {
                            node: "select list".to_string(),
                            column: Some(format!("{qualifier}.*")),
                            reason: "unknown qualifier".to_string(),
                        });
                    }
                }
                ast::SelectItem::UnnamedExpr(expr) => {
                    let bound = self.bind_expr(expr, &schema, outer)?;
                    bound.data_type(&schema)?;
                    let name = output_name(expr, &bound);
                    exprs.push((bound, name));
                }
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    let bound = self.bind_expr(expr, &schema, outer)?;
                    bound.data_type(&schema)?;
                    exprs.push((bound, alias.value.clone()));
                }
            }
        }

        let fields = exprs
            .iter()
            .map(|(e, name)| {
                Ok(Field::new(name.clone(), e.data_type(&schema)?, true))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(LogicalPlan::Project {
            input: Arc::new(input),
            exprs,
            schema: Schema::new(fields),
        })
    }

    fn bind_aggregate(
        &self,
        input: LogicalPlan,
        select: &ast::Select,
        group_exprs: &[ast::Expr],
    ) -> EngineResult<LogicalPlan> {
        let input_schema = input.schema();

        let mut group_by = Vec::with_capacity(group_exprs.len());
        let mut group_fields = Vec::with_capacity(group_exprs.len());
        let mut group_keys: Vec<String> = Vec::with_capacity(group_exprs.len());
        for expr in group_exprs {
            let bound = self.bind_expr(expr, &input_schema, None)?;
            let name = output_name(expr, &bound);
            group_fields.push(Field::new(name.clone(), bound.data_type(&input_schema)?, true));
            group_keys.push(normalize(expr));
            group_by.push(bound);
        }

        // Collect every aggregate call in the select list and HAVING.
        let mut aggregates: Vec<AggregateExpr> = Vec::new();
        let mut agg_keys: Vec<String> = Vec::new();
        for item in &select.projection {
            if let Some(expr) = select_item_expr(item) {
                self.collect_aggregates(expr, &input_schema, &mut aggregates, &mut agg_keys)?;
            }
        }
        if let Some(having) = &select.having {
            self.collect_aggregates(having, &input_schema, &mut aggregates, &mut agg_keys)?;
        }

        let mut agg_schema = Schema::new(group_fields);
        for agg in &aggregates {
            agg_schema.fields.push(Field::new(
                agg.output_name.clone(),
                agg.output_type(&input_schema)?,
                true,
            ));
        }

        let mut plan = LogicalPlan::Aggregate {
            input: Arc::new(input),
            group_by,
            aggregates: aggregates.clone(),
            schema: agg_schema.clone(),
        };

        if let Some(having) = &select.having {
            let predicate =
                self.rebind_over_aggregate(having, &agg_schema, &group_keys, &agg_keys)?;
            self.check_boolean(&predicate, &agg_schema, "HAVING")?;
            plan = LogicalPlan::Filter {
                input: Arc::new(plan),
                predicate,
            };
        }

        // The select list over an aggregate may only use grouping
        // expressions and aggregate calls.
        let mut exprs = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            match item {
                ast::SelectItem::UnnamedExpr(expr) => {
                    let bound =
                        self.rebind_over_aggregate(expr, &agg_schema, &group_keys, &agg_keys)?;
                    let name = output_name(expr, &bound);
                    exprs.push((bound, name));
                }
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    let bound =
                        self.rebind_over_aggregate(expr, &agg_schema, &group_keys, &agg_keys)?;
                    exprs.push((bound, alias.value.clone()));
                }
                _ => {
                    return Err(EngineError::Validation {
                        node: "select list".to_string(),
                        column: None,
                        reason: "wildcards cannot be grouped".to_string(),
                    })
                }
            }
        }

        let fields = exprs
            .iter()
            .map(|(e, name)| Ok(Field::new(name.clone(), e.data_type(&agg_schema)?, true)))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(LogicalPlan::Project {
            input: Arc::new(plan),
            exprs,
            schema: Schema::new(fields),
        })
    }

    fn collect_aggregates(
        &self,
        expr: &ast::Expr,
        input_schema: &Schema,
        aggregates: &mut Vec<AggregateExpr>,
        agg_keys: &mut Vec<String>,
    ) -> EngineResult<()> {
        if let Some((func, arg, distinct)) = as_aggregate_call(expr) {
            let key = normalize(expr);
            if !agg_keys.contains(&key) {
                let bound_arg = match arg {
                    Some(a) => Some(self.bind_expr(a, input_schema, None)?),
                    None => None,
                };
                aggregates.push(AggregateExpr {
                    func,
                    arg: bound_arg,
                    distinct,
                    output_name: expr.to_string(),
                });
                agg_keys.push(key);
            }
            return Ok(());
        }
        match expr {
            ast::Expr::BinaryOp { left, right, .. } => {
                self.collect_aggregates(left, input_schema, aggregates, agg_keys)?;
                self.collect_aggregates(right, input_schema, aggregates, agg_keys)?;
            }
            ast::Expr::UnaryOp { expr, .. } | ast::Expr::Nested(expr) => {
                self.collect_aggregates(expr, input_schema, aggregates, agg_keys)?;
            }
            ast::Expr::Cast { expr, .. } => {
                self.collect_aggregates(expr, input_schema, aggregates, agg_keys)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Bind an expression against the aggregate output: grouping expressions
    /// and aggregate calls become column references, anything else fails.
    fn rebind_over_aggregate(
        &self,
        expr: &ast::Expr,
        agg_schema: &Schema,
        group_keys: &[String],
        agg_keys: &[String],
    ) -> EngineResult<ScalarExpr> {
        let key = normalize(expr);
        if let Some(i) = group_keys.iter().position(|k| *k == key) {
            return Ok(ScalarExpr::column(i, agg_schema.fields[i].name.clone()));
        }
        if let Some(j) = agg_keys.iter().position(|k| *k == key) {
            let index = group_keys.len() + j;
            return Ok(ScalarExpr::column(
                index,
                agg_schema.fields[index].name.clone(),
            ));
        }
        match expr {
            ast::Expr::BinaryOp { left, op, right } => {
                let bound_left =
                    self.rebind_over_aggregate(left, agg_schema, group_keys, agg_keys)?;
                let bound_right =
                    self.rebind_over_aggregate(right, agg_schema, group_keys, agg_keys)?;
                Ok(ScalarExpr::binary(bound_left, map_binary_op(op)?, bound_right))
            }
            ast::Expr::Nested(inner) => {
                self.rebind_over_aggregate(inner, agg_schema, group_keys, agg_keys)
            }
            ast::Expr::Value(_) => self.bind_expr(expr, agg_schema, None),
            ast::Expr::Cast { .. } => self.bind_expr(expr, agg_schema, None).or_else(|_| {
                Err(EngineError::Validation {
                    node: "select list".to_string(),
                    column: Some(expr.to_string()),
                    reason: "expression must appear in GROUP BY or be aggregated".to_string(),
                })
            }),
            other => Err(EngineError::Validation {
                node: "select list".to_string(),
                column: Some(other.to_string()),
                reason: "expression must appear in GROUP BY or be aggregated".to_string(),
            }),
        }
    }

    fn bind_table_with_joins(
        &self,
        table: &ast::TableWithJoins,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        let mut plan = self.bind_table_factor(&table.relation, outer)?;

        for join in &table.joins {
            let right = self.bind_table_factor(&join.relation, outer)?;
            plan = self.bind_join(plan, right, &join.join_operator, outer)?;
        }
        Ok(plan)
    }

    fn bind_join(
        &self,
        left: LogicalPlan,
        right: LogicalPlan,
        operator: &ast::JoinOperator,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        let (join_type, constraint) = match operator {
            ast::JoinOperator::Join(c) | ast::JoinOperator::Inner(c) => (JoinType::Inner, Some(c)),
            ast::JoinOperator::Left(c) | ast::JoinOperator::LeftOuter(c) => {
                (JoinType::Left, Some(c))
            }
            ast::JoinOperator::Right(c) | ast::JoinOperator::RightOuter(c) => {
                (JoinType::Right, Some(c))
            }
            ast::JoinOperator::FullOuter(c) => (JoinType::Full, Some(c)),
            ast::JoinOperator::Semi(c) | ast::JoinOperator::LeftSemi(c) => {
                (JoinType::Semi, Some(c))
            }
            ast::JoinOperator::CrossJoin(_) => (JoinType::Inner, None),
            // STRAIGHT_JOIN pins MySQL's join order; semantically an inner join.
            ast::JoinOperator::StraightJoin(c) => (JoinType::Inner, Some(c)),
            other => {
                return Err(EngineError::Unsupported(format!(
                    "join operator {other:?}"
                )))
            }
        };

        let left_schema = left.schema();
        let right_schema = right.schema();
        let combined = left_schema.join(&right_schema);
        let left_len = left_schema.len();

        let mut on: Vec<(ScalarExpr, ScalarExpr)> = Vec::new();
        let mut residual: Vec<ScalarExpr> = Vec::new();

        match constraint {
            None | Some(ast::JoinConstraint::None) => {}
            Some(ast::JoinConstraint::On(expr)) => {
                let bound = self.bind_expr(expr, &combined, outer)?;
                self.check_boolean(&bound, &combined, "JOIN ON")?;
                for conjunct in crate::expr::split_conjunction(&bound) {
                    match split_equi_key(&conjunct, left_len) {
                        Some(pair) => on.push(pair),
                        None => residual.push(conjunct),
                    }
                }
            }
            Some(ast::JoinConstraint::Using(names)) => {
                for name in names {
                    let column = object_name_parts(name)
                        .last()
                        .cloned()
                        .unwrap_or_default();
                    let li = left_schema.resolve(None, &column)?;
                    let ri = right_schema.resolve(None, &column)?;
                    on.push((
                        ScalarExpr::column(li, column.clone()),
                        ScalarExpr::column(ri, column),
                    ));
                }
            }
            Some(ast::JoinConstraint::Natural) => {
                return Err(EngineError::Unsupported("NATURAL joins".to_string()))
            }
        }

        let schema = join_schema(&left_schema, &right_schema, join_type);
        let filter = crate::expr::conjoin(residual);
        debug!(
            join_type = %join_type,
            keys = on.len(),
            "bound join"
        );
        Ok(LogicalPlan::Join {
            left: Arc::new(left),
            right: Arc::new(right),
            join_type,
            on,
            filter,
            schema,
        })
    }

    fn bind_table_factor(
        &self,
        factor: &ast::TableFactor,
        outer: Option<&Schema>,
    ) -> EngineResult<LogicalPlan> {
        match factor {
            ast::TableFactor::Table { name, alias, .. } => {
                let parts = object_name_parts(name);
                let table = self.catalog.resolve_table(&parts)?;
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table.name.clone());
                Ok(LogicalPlan::Scan(ScanNode::new(table, alias)))
            }
            ast::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let inner = self.bind_query_scoped(subquery, outer)?;
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .ok_or_else(|| EngineError::Validation {
                        node: "derived table".to_string(),
                        column: None,
                        reason: "subquery in FROM requires an alias".to_string(),
                    })?;
                let mut schema = inner.schema();
                for field in &mut schema.fields {
                    field.qualifier = Some(alias.clone());
                }
                Ok(LogicalPlan::SubqueryAlias {
                    input: Arc::new(inner),
                    alias,
                    schema,
                })
            }
            ast::TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.bind_table_with_joins(table_with_joins, outer),
            other => Err(EngineError::Unsupported(format!(
                "table factor {other}"
            ))),
        }
    }

    fn bind_order_by(
        &self,
        order_by: &ast::OrderBy,
        schema: &Schema,
    ) -> EngineResult<Vec<SortKey>> {
        let exprs = match &order_by.kind {
            ast::OrderByKind::Expressions(exprs) => exprs,
            ast::OrderByKind::All(_) => {
                return Err(EngineError::Unsupported("ORDER BY ALL".to_string()))
            }
        };
        let mut keys = Vec::with_capacity(exprs.len());
        for item in exprs {
            let ascending = item.options.asc.unwrap_or(true);
            // SQL default: NULLS LAST when ascending, NULLS FIRST otherwise.
            let nulls_first = item.options.nulls_first.unwrap_or(!ascending);
            let expr = match ordinal_reference(&item.expr, schema.len())? {
                Some(index) => {
                    ScalarExpr::column(index, schema.fields[index].name.clone())
                }
                None => {
                    let bound = self.bind_expr(&item.expr, schema, None)?;
                    bound.data_type(schema)?;
                    bound
                }
            };
            keys.push(SortKey {
                expr,
                ascending,
                nulls_first,
            });
        }
        Ok(keys)
    }

    fn bind_show_schemas(&self) -> LogicalPlan {
        let rows = self
            .catalog
            .schema_names()
            .into_iter()
            .map(|name| vec![ScalarExpr::literal(Value::String(name))])
            .collect();
        LogicalPlan::Values {
            rows,
            schema: Schema::new(vec![Field::new("schema", LogicalType::String, false)]),
        }
    }

    fn bind_show_tables(
        &self,
        source: Option<&str>,
        pattern: Option<&str>,
    ) -> EngineResult<LogicalPlan> {
        let names = match source {
            Some(source) => self.catalog.table_names(source, None)?,
            None => {
                let mut all = Vec::new();
                for meta in self.catalog.sources() {
                    all.extend(self.catalog.table_names(&meta.id, None)?);
                }
                all
            }
        };
        let mut rows = Vec::new();
        for name in names {
            if let Some(pattern) = pattern {
                if !like_match(&name, pattern)? {
                    continue;
                }
            }
            rows.push(vec![ScalarExpr::literal(Value::String(name))]);
        }
        Ok(LogicalPlan::Values {
            rows,
            schema: Schema::new(vec![Field::new("table", LogicalType::String, false)]),
        })
    }

    /// Single-source DML: every referenced table must bind to the same
    /// relational source; names are rewritten source-local and the statement
    /// re-rendered for passthrough execution.
    fn bind_dml(&self, mut stmt: ast::Statement) -> EngineResult<BoundStatement> {
        let mut source: Option<String> = None;
        {
            let names = dml_table_names(&mut stmt)?;
            if names.is_empty() {
                return Err(EngineError::Validation {
                    node: "DML".to_string(),
                    column: None,
                    reason: "statement references no table".to_string(),
                });
            }
            for name in names {
                let parts = object_name_parts(name);
                let table = self.catalog.resolve_table(&parts)?;
                let meta = self
                    .catalog
                    .source(&table.source)
                    .ok_or_else(|| EngineError::UnknownSchema(table.source.clone()))?;
                if meta.source_type.kind() != SourceKind::RelationalRow {
                    return Err(EngineError::Unsupported(format!(
                        "DML against document-index source '{}'",
                        table.source
                    )));
                }
                match &source {
                    None => source = Some(table.source.clone()),
                    Some(existing) if *existing == table.source => {}
                    Some(_) => {
                        return Err(EngineError::Unsupported(
                            "DML spanning multiple sources".to_string(),
                        ))
                    }
                }
                *name = ast::ObjectName(vec![
                    ast::ObjectNamePart::Identifier(ast::Ident::new(table.schema.clone())),
                    ast::ObjectNamePart::Identifier(ast::Ident::new(table.name.clone())),
                ]);
            }
        }
        let source = source.expect("at least one table");
        Ok(BoundStatement::Dml {
            source,
            sql: stmt.to_string(),
        })
    }

    fn check_boolean(
        &self,
        expr: &ScalarExpr,
        schema: &Schema,
        node: &str,
    ) -> EngineResult<()> {
        let has_subquery = matches!(
            expr,
            ScalarExpr::Exists { .. } | ScalarExpr::InSubquery { .. }
        );
        if has_subquery {
            return Ok(());
        }
        let ty = expr.data_type(schema)?;
        if ty != LogicalType::Boolean {
            return Err(EngineError::Validation {
                node: node.to_string(),
                column: None,
                reason: format!("predicate must be boolean, found {ty}"),
            });
        }
        Ok(())
    }

    fn bind_expr(
        &self,
        expr: &ast::Expr,
        schema: &Schema,
        outer: Option<&Schema>,
    ) -> EngineResult<ScalarExpr> {
        match expr {
            ast::Expr::Identifier(ident) => self.bind_column(None, &ident.value, schema, outer),
            ast::Expr::CompoundIdentifier(idents) => {
                let names: Vec<String> = idents.iter().map(|i| i.value.clone()).collect();
                match names.len() {
                    2 => self.bind_column(Some(&names[0]), &names[1], schema, outer),
                    // source.table.column and deeper: qualify by the last two parts.
                    n if n >= 3 => {
                        self.bind_column(Some(&names[n - 2]), &names[n - 1], schema, outer)
                    }
                    _ => Err(EngineError::Validation {
                        node: "column reference".to_string(),
                        column: Some(names.join(".")),
                        reason: "malformed identifier".to_string(),
                    }),
                }
            }
            ast::Expr::Value(value) => bind_literal(&value.value),
            ast::Expr::TypedString(ast::TypedString { data_type, value, .. }) => {
                let target = map_ast_type(data_type)?;
                let raw = match &value.value {
                    ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                        s.clone()
                    }
                    other => other.to_string(),
                };
                Ok(ScalarExpr::Cast {
                    expr: Box::new(ScalarExpr::literal(Value::String(raw))),
                    target,
                })
            }
            ast::Expr::BinaryOp { left, op, right } => {
                let bound_left = self.bind_expr(left, schema, outer)?;
                let bound_right = self.bind_expr(right, schema, outer)?;
                let op = map_binary_op(op)?;
                let bound = ScalarExpr::binary(bound_left, op, bound_right);
                // Type-check eagerly so incompatible comparisons fail at
                // validation, not mid-execution. Correlated references are
                // checked after decorrelation instead.
                let mut outer_refs = std::collections::BTreeSet::new();
                bound.outer_columns_used(&mut outer_refs);
                if outer_refs.is_empty() {
                    bound.data_type(schema)?;
                }
                Ok(bound)
            }
            ast::Expr::UnaryOp { op, expr } => {
                let inner = self.bind_expr(expr, schema, outer)?;
                match op {
                    ast::UnaryOperator::Not => Ok(ScalarExpr::Not(Box::new(inner))),
                    ast::UnaryOperator::Minus => Ok(ScalarExpr::Negate(Box::new(inner))),
                    ast::UnaryOperator::Plus => Ok(inner),
                    other => Err(EngineError::Unsupported(format!(
                        "unary operator {other}"
                    ))),
                }
            }
            ast::Expr::IsNull(inner) => Ok(ScalarExpr::IsNull {
                expr: Box::new(self.bind_expr(inner, schema, outer)?),
                negated: false,
            }),
            ast::Expr::IsNotNull(inner) => Ok(ScalarExpr::IsNull {
                expr: Box::new(self.bind_expr(inner, schema, outer)?),
                negated: true,
            }),
            ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Ok(ScalarExpr::Like {
                expr: Box::new(self.bind_expr(expr, schema, outer)?),
                pattern: Box::new(self.bind_expr(pattern, schema, outer)?),
                negated: *negated,
            }),
            ast::Expr::ILike {
                negated,
                expr,
                pattern,
                ..
            } => {
                // Case-insensitive LIKE lowers both sides.
                let lower = |e: ScalarExpr| ScalarExpr::Function {
                    func: ScalarFunction::Lower,
                    args: vec![e],
                };
                Ok(ScalarExpr::Like {
                    expr: Box::new(lower(self.bind_expr(expr, schema, outer)?)),
                    pattern: Box::new(lower(self.bind_expr(pattern, schema, outer)?)),
                    negated: *negated,
                })
            }
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let target = self.bind_expr(expr, schema, outer)?;
                let low = self.bind_expr(low, schema, outer)?;
                let high = self.bind_expr(high, schema, outer)?;
                let range = ScalarExpr::binary(
                    ScalarExpr::binary(target.clone(), BinaryOp::GtEq, low),
                    BinaryOp::And,
                    ScalarExpr::binary(target, BinaryOp::LtEq, high),
                );
                Ok(if *negated {
                    ScalarExpr::Not(Box::new(range))
                } else {
                    range
                })
            }
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => Ok(ScalarExpr::InList {
                expr: Box::new(self.bind_expr(expr, schema, outer)?),
                list: list
                    .iter()
                    .map(|e| self.bind_expr(e, schema, outer))
                    .collect::<EngineResult<Vec<_>>>()?,
                negated: *negated,
            }),
            ast::Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Ok(ScalarExpr::InSubquery {
                expr: Box::new(self.bind_expr(expr, schema, outer)?),
                subquery: Arc::new(self.bind_query_scoped(subquery, Some(schema))?),
                negated: *negated,
            }),
            ast::Expr::Exists { subquery, negated } => Ok(ScalarExpr::Exists {
                subquery: Arc::new(self.bind_query_scoped(subquery, Some(schema))?),
                negated: *negated,
            }),
            ast::Expr::Subquery(subquery) => Ok(ScalarExpr::ScalarSubquery(Arc::new(
                self.bind_query_scoped(subquery, Some(schema))?,
            ))),
            ast::Expr::Cast {
                expr, data_type, ..
            } => {
                let inner = self.bind_expr(expr, schema, outer)?;
                let target = map_ast_type(data_type)?;
                Ok(ScalarExpr::Cast {
                    expr: Box::new(inner),
                    target,
                })
            }
            ast::Expr::Nested(inner) => self.bind_expr(inner, schema, outer),
            ast::Expr::Function(func) => self.bind_function(func, schema, outer),
            ast::Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                let mut branches = Vec::with_capacity(conditions.len());
                for case_when in conditions {
                    let mut when = self.bind_expr(&case_when.condition, schema, outer)?;
                    if let Some(operand) = operand {
                        let operand = self.bind_expr(operand, schema, outer)?;
                        when = ScalarExpr::binary(operand, BinaryOp::Eq, when);
                    }
                    let then = self.bind_expr(&case_when.result, schema, outer)?;
                    branches.push((when, then));
                }
                let else_expr = match else_result {
                    Some(e) => Some(Box::new(self.bind_expr(e, schema, outer)?)),
                    None => None,
                };
                Ok(ScalarExpr::Case {
                    branches,
                    else_expr,
                })
            }
            other => Err(EngineError::Unsupported(format!(
                "expression {other}"
            ))),
        }
    }

    fn bind_column(
        &self,
        qualifier: Option<&str>,
        name: &str,
        schema: &Schema,
        outer: Option<&Schema>,
    ) -> EngineResult<ScalarExpr> {
        match schema.resolve(qualifier, name) {
            Ok(index) => Ok(ScalarExpr::column(index, name.to_string())),
            Err(err @ EngineError::AmbiguousColumn(_)) => Err(err),
            Err(local_err) => match outer {
                Some(outer_schema) => match outer_schema.resolve(qualifier, name) {
                    Ok(index) => Ok(ScalarExpr::OuterColumn {
                        index,
                        name: name.to_string(),
                    }),
                    Err(_) => Err(local_err),
                },
                None => Err(local_err),
            },
        }
    }

    fn bind_function(
        &self,
        func: &ast::Function,
        schema: &Schema,
        outer: Option<&Schema>,
    ) -> EngineResult<ScalarExpr> {
        let name = object_name_parts(&func.name)
            .last()
            .cloned()
            .unwrap_or_default()
            .to_uppercase();

        let args = function_arg_exprs(func)?;
        let bind_all = |binder: &Self| -> EngineResult<Vec<ScalarExpr>> {
            args.iter()
                .map(|a| binder.bind_expr(a, schema, outer))
                .collect()
        };

        match name.as_str() {
            "COALESCE" | "IFNULL" | "NVL" | "ISNULL" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Coalesce,
                args: bind_all(self)?,
            }),
            "NOW" | "CURRENT_TIMESTAMP" | "GETDATE" | "SYSDATE" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Now,
                args: Vec::new(),
            }),
            "UPPER" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Upper,
                args: bind_all(self)?,
            }),
            "LOWER" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Lower,
                args: bind_all(self)?,
            }),
            "LENGTH" | "CHAR_LENGTH" | "LEN" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Length,
                args: bind_all(self)?,
            }),
            "ABS" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Abs,
                args: bind_all(self)?,
            }),
            "ROUND" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Round,
                args: bind_all(self)?,
            }),
            "CONCAT" => Ok(ScalarExpr::Function {
                func: ScalarFunction::Concat,
                args: bind_all(self)?,
            }),
            other => Err(EngineError::Unsupported(format!("function {other}"))),
        }
    }
}

/// SELECT DISTINCT and UNION distinct group on every output column.
fn distinct_over(plan: LogicalPlan) -> LogicalPlan {
    let schema = plan.schema();
    let group_by = schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| ScalarExpr::column(i, f.name.clone()))
        .collect();
    LogicalPlan::Aggregate {
        input: Arc::new(plan),
        group_by,
        aggregates: Vec::new(),
        schema,
    }
}

fn output_name(expr: &ast::Expr, bound: &ScalarExpr) -> String {
    match bound {
        ScalarExpr::Column { name, .. } => name.clone(),
        _ => expr.to_string(),
    }
}

fn normalize(expr: &ast::Expr) -> String {
    expr.to_string().to_lowercase()
}

fn trim_last_dot_star(rendered: &str) -> String {
    rendered
        .trim_end_matches('*')
        .trim_end_matches('.')
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}

fn select_item_expr(item: &ast::SelectItem) -> Option<&ast::Expr> {
    match item {
        ast::SelectItem::UnnamedExpr(expr) | ast::SelectItem::ExprWithAlias { expr, .. } => {
            Some(expr)
        }
        _ => None,
    }
}

fn contains_aggregate(expr: &ast::Expr) -> bool {
    if as_aggregate_call(expr).is_some() {
        return true;
    }
    match expr {
        ast::Expr::BinaryOp { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        ast::Expr::UnaryOp { expr, .. }
        | ast::Expr::Nested(expr)
        | ast::Expr::Cast { expr, .. } => contains_aggregate(expr),
        _ => false,
    }
}

fn as_aggregate_call(
    expr: &ast::Expr,
) -> Option<(AggregateFunction, Option<&ast::Expr>, bool)> {
    let ast::Expr::Function(func) = expr else {
        return None;
    };
    let name = object_name_parts(&func.name).last()?.to_uppercase();
    let agg = match name.as_str() {
        "COUNT" => AggregateFunction::Count,
        "SUM" => AggregateFunction::Sum,
        "MIN" => AggregateFunction::Min,
        "MAX" => AggregateFunction::Max,
        "AVG" => AggregateFunction::Avg,
        _ => return None,
    };
    let ast::FunctionArguments::List(list) = &func.args else {
        return None;
    };
    let distinct = matches!(
        list.duplicate_treatment,
        Some(ast::DuplicateTreatment::Distinct)
    );
    match list.args.as_slice() {
        [] => Some((agg, None, distinct)),
        [ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard)] => {
            Some((agg, None, distinct))
        }
        [ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(arg))] => {
            Some((agg, Some(arg), distinct))
        }
        _ => None,
    }
}

fn function_arg_exprs(func: &ast::Function) -> EngineResult<Vec<&ast::Expr>> {
    match &func.args {
        ast::FunctionArguments::None => Ok(Vec::new()),
        ast::FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => Ok(e),
                other => Err(EngineError::Unsupported(format!(
                    "function argument {other}"
                ))),
            })
            .collect(),
        ast::FunctionArguments::Subquery(_) => Err(EngineError::Unsupported(
            "subquery function arguments".to_string(),
        )),
    }
}

pub(crate) fn object_name_parts(name: &ast::ObjectName) -> Vec<String> {
    name.0
        .iter()
        .map(|part| match part {
            ast::ObjectNamePart::Identifier(ident) => ident.value.clone(),
            other => other.to_string(),
        })
        .collect()
}

fn bind_literal(value: &ast::Value) -> EngineResult<ScalarExpr> {
    let v = match value {
        ast::Value::Number(text, _) => {
            if let Ok(i) = text.parse::<i64>() {
                Value::Int64(i)
            } else if let Ok(d) = text.parse::<rust_decimal::Decimal>() {
                Value::Decimal(d)
            } else {
                text.parse::<f64>().map(Value::Float64).map_err(|_| {
                    EngineError::Validation {
                        node: "literal".to_string(),
                        column: None,
                        reason: format!("unreadable number '{text}'"),
                    }
                })?
            }
        }
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Value::String(s.clone())
        }
        ast::Value::Boolean(b) => Value::Boolean(*b),
        ast::Value::Null => Value::Null,
        other => {
            return Err(EngineError::Unsupported(format!("literal {other}")))
        }
    };
    Ok(ScalarExpr::literal(v))
}

fn map_binary_op(op: &ast::BinaryOperator) -> EngineResult<BinaryOp> {
    Ok(match op {
        ast::BinaryOperator::Eq => BinaryOp::Eq,
        ast::BinaryOperator::NotEq => BinaryOp::NotEq,
        ast::BinaryOperator::Lt => BinaryOp::Lt,
        ast::BinaryOperator::LtEq => BinaryOp::LtEq,
        ast::BinaryOperator::Gt => BinaryOp::Gt,
        ast::BinaryOperator::GtEq => BinaryOp::GtEq,
        ast::BinaryOperator::And => BinaryOp::And,
        ast::BinaryOperator::Or => BinaryOp::Or,
        ast::BinaryOperator::Plus => BinaryOp::Plus,
        ast::BinaryOperator::Minus => BinaryOp::Minus,
        ast::BinaryOperator::Multiply => BinaryOp::Multiply,
        ast::BinaryOperator::Divide => BinaryOp::Divide,
        ast::BinaryOperator::Modulo => BinaryOp::Modulo,
        other => {
            return Err(EngineError::Unsupported(format!("operator {other}")))
        }
    })
}

pub(crate) fn map_ast_type(data_type: &ast::DataType) -> EngineResult<LogicalType> {
    use ast::DataType::*;
    Ok(match data_type {
        Char(_) | Varchar(_) | Nvarchar(_) | Text | String(_) | CharVarying(_)
        | CharacterVarying(_) => LogicalType::String,
        Boolean | Bool => LogicalType::Boolean,
        TinyInt(_) | SmallInt(_) | Int(_) | Integer(_) | MediumInt(_) => LogicalType::Int32,
        BigInt(_) | Int8(_) => LogicalType::Int64,
        Float(_) | Real | Double(_) | DoublePrecision | Float64 => LogicalType::Float64,
        Decimal(_) | Numeric(_) | Dec(_) => LogicalType::Decimal,
        Date => LogicalType::Date,
        Timestamp(..) | Datetime(_) => LogicalType::Timestamp,
        Binary(_) | Varbinary(_) | Blob(_) | Bytea => LogicalType::Binary,
        Array(_) => LogicalType::Array,
        JSON | JSONB => LogicalType::Json,
        other => {
            return Err(EngineError::Unsupported(format!("type {other} in cast")))
        }
    })
}

/// Join conjunct of the shape `left-side = right-side`, split into per-side
/// keys with the right key rebased onto the right input's ordinals.
fn split_equi_key(conjunct: &ScalarExpr, left_len: usize) -> Option<(ScalarExpr, ScalarExpr)> {
    let ScalarExpr::Binary {
        left,
        op: BinaryOp::Eq,
        right,
    } = conjunct
    else {
        return None;
    };

    let side_of = |e: &ScalarExpr| -> Option<bool> {
        // true = entirely left side, false = entirely right side
        let mut cols = std::collections::BTreeSet::new();
        e.columns_used(&mut cols);
        if cols.is_empty() {
            return None;
        }
        if cols.iter().all(|&c| c < left_len) {
            Some(true)
        } else if cols.iter().all(|&c| c >= left_len) {
            Some(false)
        } else {
            None
        }
    };

    let rebase = |e: &ScalarExpr| e.remap_columns(&|i| i.checked_sub(left_len));

    match (side_of(left), side_of(right)) {
        (Some(true), Some(false)) => Some((left.as_ref().clone(), rebase(right)?)),
        (Some(false), Some(true)) => Some((right.as_ref().clone(), rebase(left)?)),
        _ => None,
    }
}

fn ordinal_reference(expr: &ast::Expr, width: usize) -> EngineResult<Option<usize>> {
    if let ast::Expr::Value(v) = expr {
        if let ast::Value::Number(text, _) = &v.value {
            let ordinal: usize = text.parse().map_err(|_| EngineError::Validation {
                node: "ORDER BY".to_string(),
                column: None,
                reason: format!("bad ordinal '{text}'"),
            })?;
            if ordinal == 0 || ordinal > width {
                return Err(EngineError::Validation {
                    node: "ORDER BY".to_string(),
                    column: None,
                    reason: format!("ordinal {ordinal} out of range 1..={width}"),
                });
            }
            return Ok(Some(ordinal - 1));
        }
    }
    Ok(None)
}

pub(crate) fn extract_pagination(query: &ast::Query) -> EngineResult<(Option<u64>, u64)> {
    let mut limit: Option<u64> = None;
    let mut offset: u64 = 0;

    match &query.limit_clause {
        Some(ast::LimitClause::LimitOffset {
            limit: limit_expr,
            offset: offset_expr,
            ..
        }) => {
            if let Some(e) = limit_expr {
                limit = Some(expr_to_u64(e, "LIMIT")?);
            }
            if let Some(o) = offset_expr {
                offset = expr_to_u64(&o.value, "OFFSET")?;
            }
        }
        Some(ast::LimitClause::OffsetCommaLimit {
            offset: offset_expr,
            limit: limit_expr,
        }) => {
            offset = expr_to_u64(offset_expr, "OFFSET")?;
            limit = Some(expr_to_u64(limit_expr, "LIMIT")?);
        }
        None => {}
    }

    if let Some(fetch) = &query.fetch {
        if let Some(quantity) = &fetch.quantity {
            limit = Some(expr_to_u64(quantity, "FETCH")?);
        }
    }

    Ok((limit, offset))
}

pub(crate) fn top_quantity(select: &ast::Select) -> EngineResult<Option<u64>> {
    let Some(top) = &select.top else {
        return Ok(None);
    };
    match &top.quantity {
        Some(ast::TopQuantity::Constant(n)) => Ok(Some(*n)),
        Some(ast::TopQuantity::Expr(e)) => Ok(Some(expr_to_u64(e, "TOP")?)),
        None => Ok(None),
    }
}

fn expr_to_u64(expr: &ast::Expr, clause: &str) -> EngineResult<u64> {
    if let ast::Expr::Value(v) = expr {
        if let ast::Value::Number(text, _) = &v.value {
            return text.parse::<u64>().map_err(|_| EngineError::Validation {
                node: clause.to_string(),
                column: None,
                reason: format!("expected a non-negative integer, found '{text}'"),
            });
        }
    }
    Err(EngineError::Validation {
        node: clause.to_string(),
        column: None,
        reason: format!("expected a literal count, found '{expr}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::parser::parse;
    use rstest::rstest;

    fn bind(sql: &str) -> EngineResult<BoundStatement> {
        let catalog = federated_catalog();
        let parsed = parse(sql, None)?;
        Binder::new(&catalog).bind_statement(parsed)
    }

    fn bind_plan(sql: &str) -> LogicalPlan {
        match bind(sql).unwrap() {
            BoundStatement::Select(plan) => plan,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn federated_join_binds() {
        let plan = bind_plan(
            "SELECT o.id, o.customer, l.access_time \
             FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id \
             WHERE o.status = 'completed'",
        );
        let schema = plan.schema();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.fields[0].name, "id");
        assert_eq!(schema.fields[2].name, "access_time");
        assert_eq!(
            plan.sources(),
            vec!["mysql_db".to_string(), "es_logs".to_string()]
        );
    }

    #[test]
    fn join_keys_split_by_side() {
        let plan = bind_plan(
            "SELECT o.id FROM mysql_db.orders o \
             JOIN es_logs.access_logs l ON o.id = l.order_id AND l.order_id > 5",
        );
        fn find_join(plan: &LogicalPlan) -> Option<(usize, bool)> {
            if let LogicalPlan::Join { on, filter, .. } = plan {
                return Some((on.len(), filter.is_some()));
            }
            plan.inputs().iter().find_map(|i| find_join(i))
        }
        let (keys, has_residual) = find_join(&plan).unwrap();
        assert_eq!(keys, 1);
        // The single-side conjunct is not an equi key; it stays as residual
        // until filter pushdown claims it.
        assert!(has_residual);
    }

    #[rstest]
    #[case("SELECT missing FROM mysql_db.orders")]
    #[case("SELECT o.id FROM mysql_db.orders o WHERE o.nope = 1")]
    #[case("SELECT id FROM mysql_db.no_such_table")]
    #[case("SELECT id FROM unknown_source.orders")]
    fn unknown_references_fail(#[case] sql: &str) {
        let err = bind(sql).unwrap_err();
        assert_eq!(err.code(), 1002);
    }

    #[test]
    fn self_join_makes_unqualified_column_ambiguous() {
        let err = bind(
            "SELECT a.id FROM mysql_db.orders a JOIN mysql_db.orders b ON a.id = b.id \
             WHERE id = 3",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousColumn(_)));
    }

    #[test]
    fn incompatible_comparison_fails_validation() {
        let err = bind("SELECT id FROM mysql_db.orders WHERE status = TRUE").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn string_numeric_comparison_is_implicitly_coerced() {
        // status is a string; comparing to a number coerces the string side.
        assert!(bind("SELECT id FROM mysql_db.orders WHERE id = '42'").is_ok());
    }

    #[test]
    fn group_by_with_aggregates() {
        let plan = bind_plan(
            "SELECT status, COUNT(*), SUM(id) FROM mysql_db.orders GROUP BY status",
        );
        let schema = plan.schema();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.fields[0].name, "status");
        assert_eq!(schema.fields[1].data_type, LogicalType::Int64);
    }

    #[test]
    fn bare_column_over_aggregate_fails() {
        let err =
            bind("SELECT customer FROM mysql_db.orders GROUP BY status").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn having_binds_against_aggregate_output() {
        let plan = bind_plan(
            "SELECT status, COUNT(*) AS n FROM mysql_db.orders GROUP BY status \
             HAVING COUNT(*) > 10",
        );
        // Project over Filter over Aggregate.
        assert_eq!(plan.node_name(), "Project");
        let filter = plan.inputs()[0].clone();
        assert_eq!(filter.node_name(), "Filter");
    }

    #[test]
    fn order_by_ordinal_and_pagination() {
        let plan = bind_plan("SELECT id, customer FROM mysql_db.orders ORDER BY 2 DESC LIMIT 10 OFFSET 5");
        match &plan {
            LogicalPlan::Limit { limit, offset, input } => {
                assert_eq!(*limit, Some(10));
                assert_eq!(*offset, 5);
                assert_eq!(input.node_name(), "Sort");
            }
            other => panic!("expected Limit, got {}", other.node_name()),
        }
    }

    #[test]
    fn select_top_binds_as_limit() {
        let catalog = federated_catalog();
        let parsed = parse("SELECT TOP 3 id FROM mysql_db.orders", Some(crate::dialect::Dialect::SqlServer)).unwrap();
        let BoundStatement::Select(plan) = Binder::new(&catalog).bind_statement(parsed).unwrap()
        else {
            panic!("expected select");
        };
        assert_eq!(plan.node_name(), "Limit");
    }

    #[test]
    fn distinct_becomes_grouping() {
        let plan = bind_plan("SELECT DISTINCT status FROM mysql_db.orders");
        assert_eq!(plan.node_name(), "Aggregate");
    }

    #[test]
    fn union_all_and_distinct() {
        let all = bind_plan(
            "SELECT id FROM mysql_db.orders UNION ALL SELECT id FROM mysql_db.orders",
        );
        assert_eq!(all.node_name(), "Union");
        let distinct = bind_plan(
            "SELECT id FROM mysql_db.orders UNION SELECT id FROM mysql_db.orders",
        );
        assert_eq!(distinct.node_name(), "Aggregate");
    }

    #[test]
    fn exists_subquery_binds_with_correlation() {
        let plan = bind_plan(
            "SELECT o.id FROM mysql_db.orders o WHERE EXISTS \
             (SELECT 1 FROM es_logs.access_logs l WHERE l.order_id = o.id)",
        );
        fn find_exists(plan: &LogicalPlan) -> bool {
            let mut found = false;
            plan.visit_exprs(&mut |e| {
                if matches!(e, ScalarExpr::Exists { .. }) {
                    found = true;
                }
            });
            found
        }
        assert!(find_exists(&plan));
    }

    #[test]
    fn in_subquery_binds() {
        let plan = bind_plan(
            "SELECT id FROM mysql_db.orders WHERE id IN \
             (SELECT order_id FROM es_logs.access_logs)",
        );
        let mut found = false;
        plan.visit_exprs(&mut |e| {
            if matches!(e, ScalarExpr::InSubquery { .. }) {
                found = true;
            }
        });
        assert!(found);
    }

    #[test]
    fn show_tables_with_pattern() {
        let plan = bind_plan("SHOW TABLES FROM es_logs LIKE 'acc%'");
        match plan {
            LogicalPlan::Values { rows, .. } => {
                assert_eq!(rows.len(), 1);
            }
            other => panic!("expected Values, got {}", other.node_name()),
        }
    }

    #[test]
    fn show_schemas_lists_all() {
        let plan = bind_plan("SHOW SCHEMAS");
        match plan {
            LogicalPlan::Values { rows, .. } => assert_eq!(rows.len(), 2),
            other => panic!("expected Values, got {}", other.node_name()),
        }
    }

    #[test]
    fn dml_single_source_passthrough() {
        let bound = bind("DELETE FROM mysql_db.orders WHERE id = 7").unwrap();
        match bound {
            BoundStatement::Dml { source, sql } => {
                assert_eq!(source, "mysql_db");
                assert!(sql.contains("shop"), "rewritten to source-local name: {sql}");
                assert!(!sql.contains("mysql_db"), "source id stripped: {sql}");
            }
            other => panic!("expected DML, got {other:?}"),
        }
    }

    #[test]
    fn dml_against_index_source_fails() {
        let err = bind("DELETE FROM es_logs.access_logs WHERE order_id = 1").unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn cte_is_unsupported() {
        let err = bind("WITH x AS (SELECT 1) SELECT * FROM x").unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}

/// Collect mutable references to every table name in a DML statement.
fn dml_table_names(stmt: &mut ast::Statement) -> EngineResult<Vec<&mut ast::ObjectName>> {
    match stmt {
        ast::Statement::Insert(insert) => match &mut insert.table {
            ast::TableObject::TableName(name) => Ok(vec![name]),
            other => Err(EngineError::Unsupported(format!(
                "INSERT target {other}"
            ))),
        },
        ast::Statement::Update {
            table,
            from,
            ..
        } => {
            if from.is_some() || !table.joins.is_empty() {
                return Err(EngineError::Unsupported(
                    "multi-table UPDATE".to_string(),
                ));
            }
            match &mut table.relation {
                ast::TableFactor::Table { name, .. } => Ok(vec![name]),
                other => Err(EngineError::Unsupported(format!(
                    "UPDATE target {other}"
                ))),
            }
        }
        ast::Statement::Delete(delete) => {
            if !delete.tables.is_empty() || delete.using.is_some() {
                return Err(EngineError::Unsupported(
                    "multi-table DELETE".to_string(),
                ));
            }
            let tables = match &mut delete.from {
                ast::FromTable::WithFromKeyword(tables)
                | ast::FromTable::WithoutKeyword(tables) => tables,
            };
            let mut names = Vec::new();
            for table in tables {
                if !table.joins.is_empty() {
                    return Err(EngineError::Unsupported(
                        "DELETE with joins".to_string(),
                    ));
                }
                match &mut table.relation {
                    ast::TableFactor::Table { name, .. } => names.push(name),
                    other => {
                        return Err(EngineError::Unsupported(format!(
                            "DELETE target {other}"
                        )))
                    }
                }
            }
            Ok(names)
        }
        other => Err(EngineError::Internal(format!(
            "not a DML statement: {other}"
        ))),
    }
}
