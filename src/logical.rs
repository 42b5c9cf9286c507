//! Dialect-neutral logical plan.
//!
//! Nodes are immutable between optimiser passes: every rewrite builds a new
//! tree and the old one stays valid. Each node knows its output row type.

use crate::catalog::TableMeta;
use crate::error::{EngineError, EngineResult};
use crate::expr::{AggregateExpr, ScalarExpr};
use crate::types::{Field, Schema};
use std::fmt;
use std::sync::Arc;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JoinType {
    #[strum(serialize = "INNER")]
    Inner,
    #[strum(serialize = "LEFT")]
    Left,
    #[strum(serialize = "RIGHT")]
    Right,
    #[strum(serialize = "FULL")]
    Full,
    #[strum(serialize = "SEMI")]
    Semi,
}

impl JoinType {
    /// Right side columns appear in the output (semi joins emit only the left).
    pub fn emits_right(&self) -> bool {
        !matches!(self, JoinType::Semi)
    }
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: ScalarExpr,
    pub ascending: bool,
    pub nulls_first: bool,
}

/// Aggregation delegated into a scan by the aggregate-split rule.
///
/// Because the scan is single-source, the source computes complete groups
/// and the engine-side merge is a passthrough.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanAggregate {
    /// Grouping keys as scan-output ordinals.
    pub group_by: Vec<usize>,
    pub aggregates: Vec<AggregateExpr>,
    pub schema: Schema,
}

/// Leaf scan over one catalogued table.
///
/// `projection` and `filter` start empty; the pushdown rules fill them in
/// and the physical planner hands them to the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanNode {
    pub table: Arc<TableMeta>,
    pub alias: String,
    /// Ordinals into `table.columns` retained by projection pushdown.
    pub projection: Option<Vec<usize>>,
    /// Predicate over base table ordinals; the scan filters before it
    /// projects.
    pub filter: Option<ScalarExpr>,
    pub limit: Option<u64>,
    pub aggregate: Option<ScanAggregate>,
}

impl ScanNode {
    pub fn new(table: Arc<TableMeta>, alias: impl Into<String>) -> Self {
        ScanNode {
            table,
            alias: alias.into(),
            projection: None,
            filter: None,
            limit: None,
            aggregate: None,
        }
    }

    pub fn output_schema(&self) -> Schema {
        if let Some(aggregate) = &self.aggregate {
            return aggregate.schema.clone();
        }
        self.base_schema()
    }

    /// Row type delivered by the source before any pushed aggregate.
    pub fn base_schema(&self) -> Schema {
        let fields: Vec<Field> = match &self.projection {
            Some(indices) => indices
                .iter()
                .filter_map(|&i| self.table.columns.get(i))
                .map(|c| {
                    Field::new(c.name.clone(), c.data_type, c.nullable)
                        .with_qualifier(self.alias.clone())
                })
                .collect(),
            None => self
                .table
                .columns
                .iter()
                .map(|c| {
                    Field::new(c.name.clone(), c.data_type, c.nullable)
                        .with_qualifier(self.alias.clone())
                })
                .collect(),
        };
        Schema::new(fields)
    }
}

/// Logical relational operator tree.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    Scan(ScanNode),
    Filter {
        input: Arc<LogicalPlan>,
        predicate: ScalarExpr,
    },
    Project {
        input: Arc<LogicalPlan>,
        exprs: Vec<(ScalarExpr, String)>,
        schema: Schema,
    },
    Join {
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        join_type: JoinType,
        /// Equi-join key pairs: (left-side expr, right-side expr), each bound
        /// against its own input schema.
        on: Vec<(ScalarExpr, ScalarExpr)>,
        /// Residual non-equi condition bound against the joined schema.
        filter: Option<ScalarExpr>,
        schema: Schema,
    },
    Aggregate {
        input: Arc<LogicalPlan>,
        group_by: Vec<ScalarExpr>,
        aggregates: Vec<AggregateExpr>,
        schema: Schema,
    },
    Sort {
        input: Arc<LogicalPlan>,
        keys: Vec<SortKey>,
    },
    Limit {
        input: Arc<LogicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
    Union {
        inputs: Vec<Arc<LogicalPlan>>,
        all: bool,
        schema: Schema,
    },
    SubqueryAlias {
        input: Arc<LogicalPlan>,
        alias: String,
        schema: Schema,
    },
    /// Inline constant relation (uncorrelated scalar subqueries collapse to
    /// this; SHOW commands materialise into it).
    Values {
        rows: Vec<Vec<ScalarExpr>>,
        schema: Schema,
    },
}

impl LogicalPlan {
    pub fn schema(&self) -> Schema {
        match self {
            LogicalPlan::Scan(scan) => scan.output_schema(),
            LogicalPlan::Filter { input, .. } => input.schema(),
            LogicalPlan::Project { schema, .. } => schema.clone(),
            LogicalPlan::Join { schema, .. } => schema.clone(),
            LogicalPlan::Aggregate { schema, .. } => schema.clone(),
            LogicalPlan::Sort { input, .. } => input.schema(),
            LogicalPlan::Limit { input, .. } => input.schema(),
            LogicalPlan::Union { schema, .. } => schema.clone(),
            LogicalPlan::SubqueryAlias { schema, .. } => schema.clone(),
            LogicalPlan::Values { schema, .. } => schema.clone(),
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<LogicalPlan>> {
        match self {
            LogicalPlan::Scan(_) | LogicalPlan::Values { .. } => Vec::new(),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. } => vec![input],
            LogicalPlan::Join { left, right, .. } => vec![left, right],
            LogicalPlan::Union { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Rebuild this node over replacement inputs (same arity).
    pub fn with_new_inputs(&self, new_inputs: Vec<Arc<LogicalPlan>>) -> EngineResult<LogicalPlan> {
        let arity_err = || EngineError::Internal("plan rebuild arity mismatch".to_string());
        let one = |inputs: &Vec<Arc<LogicalPlan>>| {
            inputs.first().cloned().ok_or_else(arity_err)
        };
        Ok(match self {
            LogicalPlan::Scan(scan) => LogicalPlan::Scan(scan.clone()),
            LogicalPlan::Values { rows, schema } => LogicalPlan::Values {
                rows: rows.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Filter { predicate, .. } => LogicalPlan::Filter {
                input: one(&new_inputs)?,
                predicate: predicate.clone(),
            },
            LogicalPlan::Project { exprs, schema, .. } => LogicalPlan::Project {
                input: one(&new_inputs)?,
                exprs: exprs.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Join {
                join_type,
                on,
                filter,
                schema,
                ..
            } => {
                if new_inputs.len() != 2 {
                    return Err(arity_err());
                }
                LogicalPlan::Join {
                    left: new_inputs[0].clone(),
                    right: new_inputs[1].clone(),
                    join_type: *join_type,
                    on: on.clone(),
                    filter: filter.clone(),
                    schema: schema.clone(),
                }
            }
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                schema,
                ..
            } => LogicalPlan::Aggregate {
                input: one(&new_inputs)?,
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Sort { keys, .. } => LogicalPlan::Sort {
                input: one(&new_inputs)?,
                keys: keys.clone(),
            },
            LogicalPlan::Limit { limit, offset, .. } => LogicalPlan::Limit {
                input: one(&new_inputs)?,
                limit: *limit,
                offset: *offset,
            },
            LogicalPlan::Union { all, schema, .. } => LogicalPlan::Union {
                inputs: new_inputs,
                all: *all,
                schema: schema.clone(),
            },
            LogicalPlan::SubqueryAlias { alias, schema, .. } => LogicalPlan::SubqueryAlias {
                input: one(&new_inputs)?,
                alias: alias.clone(),
                schema: schema.clone(),
            },
        })
    }

    /// Every distinct source id referenced by scans under this node.
    pub fn sources(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_sources(&mut out);
        out.dedup();
        out
    }

    fn collect_sources(&self, out: &mut Vec<String>) {
        if let LogicalPlan::Scan(scan) = self {
            if !out.contains(&scan.table.source) {
                out.push(scan.table.source.clone());
            }
        }
        for input in self.inputs() {
            input.collect_sources(out);
        }
    }

    /// Visit every expression held directly by nodes of this subtree.
    pub fn visit_exprs(&self, f: &mut dyn FnMut(&ScalarExpr)) {
        match self {
            LogicalPlan::Scan(scan) => {
                if let Some(filter) = &scan.filter {
                    f(filter);
                }
                if let Some(aggregate) = &scan.aggregate {
                    for agg in &aggregate.aggregates {
                        if let Some(arg) = &agg.arg {
                            f(arg);
                        }
                    }
                }
            }
            LogicalPlan::Filter { predicate, .. } => f(predicate),
            LogicalPlan::Project { exprs, .. } => {
                for (e, _) in exprs {
                    f(e);
                }
            }
            LogicalPlan::Join { on, filter, .. } => {
                for (l, r) in on {
                    f(l);
                    f(r);
                }
                if let Some(residual) = filter {
                    f(residual);
                }
            }
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                ..
            } => {
                for g in group_by {
                    f(g);
                }
                for a in aggregates {
                    if let Some(arg) = &a.arg {
                        f(arg);
                    }
                }
            }
            LogicalPlan::Sort { keys, .. } => {
                for k in keys {
                    f(&k.expr);
                }
            }
            LogicalPlan::Values { rows, .. } => {
                for row in rows {
                    for e in row {
                        f(e);
                    }
                }
            }
            LogicalPlan::Limit { .. }
            | LogicalPlan::Union { .. }
            | LogicalPlan::SubqueryAlias { .. } => {}
        }
        for input in self.inputs() {
            input.visit_exprs(f);
        }
    }

    /// Outer-scope ordinals referenced anywhere under this subquery plan.
    pub fn outer_columns(&self, acc: &mut std::collections::BTreeSet<usize>) {
        self.visit_exprs(&mut |expr| expr.outer_columns_used(acc));
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            LogicalPlan::Scan(_) => "Scan",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Project { .. } => "Project",
            LogicalPlan::Join { .. } => "Join",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::Union { .. } => "Union",
            LogicalPlan::SubqueryAlias { .. } => "SubqueryAlias",
            LogicalPlan::Values { .. } => "Values",
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for _ in 0..indent {
            write!(f, "  ")?;
        }
        match self {
            LogicalPlan::Scan(scan) => {
                write!(f, "Scan: {} as {}", scan.table.qualified_name(), scan.alias)?;
                if let Some(p) = &scan.projection {
                    let names: Vec<&str> = p
                        .iter()
                        .filter_map(|&i| scan.table.columns.get(i))
                        .map(|c| c.name.as_str())
                        .collect();
                    write!(f, " cols=[{}]", names.join(", "))?;
                }
                if let Some(filter) = &scan.filter {
                    write!(f, " filter={filter}")?;
                }
                if let Some(limit) = scan.limit {
                    write!(f, " limit={limit}")?;
                }
                if scan.aggregate.is_some() {
                    write!(f, " aggregate=pushed")?;
                }
                writeln!(f)
            }
            LogicalPlan::Filter { predicate, .. } => writeln!(f, "Filter: {predicate}"),
            LogicalPlan::Project { exprs, .. } => {
                let cols: Vec<String> = exprs
                    .iter()
                    .map(|(e, name)| format!("{e} AS {name}"))
                    .collect();
                writeln!(f, "Project: {}", cols.join(", "))
            }
            LogicalPlan::Join {
                join_type,
                on,
                filter,
                ..
            } => {
                let keys: Vec<String> = on
                    .iter()
                    .map(|(l, r)| format!("{l} = {r}"))
                    .collect();
                write!(f, "{join_type} Join: on [{}]", keys.join(", "))?;
                if let Some(residual) = filter {
                    write!(f, " filter={residual}")?;
                }
                writeln!(f)
            }
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                ..
            } => {
                let groups: Vec<String> = group_by.iter().map(|g| g.to_string()).collect();
                let aggs: Vec<String> = aggregates
                    .iter()
                    .map(|a| {
                        format!(
                            "{}({})",
                            a.func,
                            a.arg.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "*".into())
                        )
                    })
                    .collect();
                writeln!(
                    f,
                    "Aggregate: group=[{}] aggs=[{}]",
                    groups.join(", "),
                    aggs.join(", ")
                )
            }
            LogicalPlan::Sort { keys, .. } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .map(|k| {
                        format!("{} {}", k.expr, if k.ascending { "ASC" } else { "DESC" })
                    })
                    .collect();
                writeln!(f, "Sort: {}", rendered.join(", "))
            }
            LogicalPlan::Limit { limit, offset, .. } => {
                writeln!(f, "Limit: limit={limit:?} offset={offset}")
            }
            LogicalPlan::Union { all, .. } => {
                writeln!(f, "Union{}", if *all { " All" } else { "" })
            }
            LogicalPlan::SubqueryAlias { alias, .. } => writeln!(f, "SubqueryAlias: {alias}"),
            LogicalPlan::Values { rows, .. } => writeln!(f, "Values: {} row(s)", rows.len()),
        }?;
        for input in self.inputs() {
            input.fmt_indented(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Build the output schema of a join.
pub fn join_schema(left: &Schema, right: &Schema, join_type: JoinType) -> Schema {
    match join_type {
        JoinType::Semi => left.clone(),
        JoinType::Inner => left.join(right),
        JoinType::Left => {
            let mut s = left.clone();
            s.fields.extend(right.fields.iter().cloned().map(|mut f| {
                f.nullable = true;
                f
            }));
            s
        }
        JoinType::Right => {
            let mut s = Schema::new(
                left.fields
                    .iter()
                    .cloned()
                    .map(|mut f| {
                        f.nullable = true;
                        f
                    })
                    .collect(),
            );
            s.fields.extend(right.fields.iter().cloned());
            s
        }
        JoinType::Full => Schema::new(
            left.fields
                .iter()
                .chain(right.fields.iter())
                .cloned()
                .map(|mut f| {
                    f.nullable = true;
                    f
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::expr::BinaryOp;
    use crate::types::{LogicalType, Value};

    fn orders_scan() -> (Arc<TableMeta>, LogicalPlan) {
        let catalog = federated_catalog();
        let table = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let plan = LogicalPlan::Scan(ScanNode::new(table.clone(), "o"));
        (table, plan)
    }

    #[test]
    fn scan_schema_follows_projection() {
        let (table, _) = orders_scan();
        let mut scan = ScanNode::new(table, "o");
        assert_eq!(scan.output_schema().len(), 3);
        scan.projection = Some(vec![0, 1]);
        let schema = scan.output_schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.fields[0].name, "id");
        assert_eq!(schema.fields[1].name, "customer");
        assert_eq!(schema.fields[0].qualifier.as_deref(), Some("o"));
    }

    #[test]
    fn filter_preserves_input_schema() {
        let (_, scan) = orders_scan();
        let schema_before = scan.schema();
        let filtered = LogicalPlan::Filter {
            input: Arc::new(scan),
            predicate: ScalarExpr::binary(
                ScalarExpr::column(2, "status"),
                BinaryOp::Eq,
                ScalarExpr::literal(Value::String("completed".into())),
            ),
        };
        assert_eq!(filtered.schema(), schema_before);
    }

    #[test]
    fn join_schema_nullability() {
        let left = Schema::new(vec![Field::new("id", LogicalType::Int64, false)]);
        let right = Schema::new(vec![Field::new("order_id", LogicalType::Int64, false)]);
        let inner = join_schema(&left, &right, JoinType::Inner);
        assert!(!inner.fields[0].nullable && !inner.fields[1].nullable);
        let left_join = join_schema(&left, &right, JoinType::Left);
        assert!(!left_join.fields[0].nullable);
        assert!(left_join.fields[1].nullable);
        let semi = join_schema(&left, &right, JoinType::Semi);
        assert_eq!(semi.len(), 1);
    }

    #[test]
    fn sources_deduplicated() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let logs = catalog
            .resolve_table(&["es_logs".into(), "access_logs".into()])
            .unwrap();
        let left = Arc::new(LogicalPlan::Scan(ScanNode::new(orders, "o")));
        let right = Arc::new(LogicalPlan::Scan(ScanNode::new(logs, "l")));
        let schema = join_schema(&left.schema(), &right.schema(), JoinType::Inner);
        let join = LogicalPlan::Join {
            left,
            right,
            join_type: JoinType::Inner,
            on: vec![(
                ScalarExpr::column(0, "id"),
                ScalarExpr::column(0, "order_id"),
            )],
            filter: None,
            schema,
        };
        assert_eq!(join.sources(), vec!["mysql_db".to_string(), "es_logs".to_string()]);
    }

    #[test]
    fn rebuild_preserves_node_shape() {
        let (_, scan) = orders_scan();
        let input = Arc::new(scan);
        let limit = LogicalPlan::Limit {
            input: input.clone(),
            limit: Some(10),
            offset: 5,
        };
        let rebuilt = limit.with_new_inputs(vec![input]).unwrap();
        match rebuilt {
            LogicalPlan::Limit { limit, offset, .. } => {
                assert_eq!(limit, Some(10));
                assert_eq!(offset, 5);
            }
            other => panic!("expected Limit, got {}", other.node_name()),
        }
    }
}
